//! Notes, memos and in-band note encryption.
//!
//! Sender: ephemeral secp256k1 key `esk`, shared secret `esk·addr`.
//! Recipient: shared secret `ivk·epk`. Both sides derive the AEAD key as
//! `BLAKE3(DS_NOTE_KEY || shared_x || epk)`. The key is fresh per output, so a
//! fixed nonce is safe.

use borsh::{BorshDeserialize, BorshSerialize};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use k256::ecdh::EphemeralSecret;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use veil_core::{
    hash32, note_commitment, Amount, Commitment, EncryptedNote, OutputDescription,
    EMPTY_MEMO_MARKER, MEMO_SIZE,
};

use crate::error::WalletError;
use crate::keys::PaymentAddress;

const DS_NOTE_KEY: &[u8] = b"VEIL::NOTE_KEY::V0";

/// Fixed-size memo carried in every note.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Memo([u8; MEMO_SIZE]);

impl Memo {
    /// Memo with no content.
    pub fn empty() -> Self {
        let mut bytes = [0u8; MEMO_SIZE];
        bytes[0] = EMPTY_MEMO_MARKER;
        Self(bytes)
    }

    /// Memo from arbitrary bytes, zero padded. Empty input gives [`Memo::empty`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, WalletError> {
        if data.len() > MEMO_SIZE {
            return Err(WalletError::MemoTooLong(data.len()));
        }
        if data.is_empty() {
            return Ok(Self::empty());
        }
        let mut bytes = [0u8; MEMO_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self(bytes))
    }

    /// Whether this is the no-content memo.
    pub fn is_empty(&self) -> bool {
        self.0[0] == EMPTY_MEMO_MARKER && self.0[1..].iter().all(|b| *b == 0)
    }

    /// Raw memo bytes.
    pub fn as_bytes(&self) -> &[u8; MEMO_SIZE] {
        &self.0
    }

    /// Memo content as text, with trailing zero padding removed.
    pub fn to_text(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let end = self.0.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        String::from_utf8(self.0[..end].to_vec()).ok()
    }
}

impl Default for Memo {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for Memo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "Memo({text:?})"),
            None if self.is_empty() => f.write_str("Memo(empty)"),
            None => write!(f, "Memo(0x{})", hex::encode(&self.0[..16])),
        }
    }
}

/// A shielded note in the clear.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Note {
    /// Recipient.
    pub address: PaymentAddress,
    /// Value in atoms.
    pub value: Amount,
    /// Commitment trapdoor.
    pub rcm: [u8; 32],
    /// Attached memo.
    pub memo: Memo,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct NotePlaintext {
    value: Amount,
    rcm: [u8; 32],
    memo: Memo,
}

impl Note {
    /// New note with a random trapdoor.
    pub fn new(address: PaymentAddress, value: Amount, memo: Memo) -> Self {
        let mut rcm = [0u8; 32];
        OsRng.fill_bytes(&mut rcm);
        Self {
            address,
            value,
            rcm,
            memo,
        }
    }

    /// Commitment published for this note.
    pub fn commitment(&self) -> Commitment {
        note_commitment(&self.address.0, self.value, &self.rcm)
    }

    /// Build the on-chain output for this note.
    pub fn to_output(&self) -> Result<OutputDescription, WalletError> {
        Ok(OutputDescription {
            cm: self.commitment(),
            note: encrypt_note(self)?,
        })
    }
}

fn note_key(shared_x: &[u8], epk: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut input = Zeroizing::new(Vec::with_capacity(shared_x.len() + epk.len()));
    input.extend_from_slice(shared_x);
    input.extend_from_slice(epk);
    Zeroizing::new(hash32(DS_NOTE_KEY, &input).0)
}

/// Encrypt `note` to its recipient.
pub fn encrypt_note(note: &Note) -> Result<EncryptedNote, WalletError> {
    let recipient = note.address.public_key()?;
    let esk = EphemeralSecret::random(&mut OsRng);
    let epk = esk.public_key().to_encoded_point(true);
    let shared = esk.diffie_hellman(&recipient);
    let key = note_key(shared.raw_secret_bytes().as_slice(), epk.as_bytes());

    let plaintext = Zeroizing::new(borsh::to_vec(&NotePlaintext {
        value: note.value,
        rcm: note.rcm,
        memo: note.memo.clone(),
    })?);
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let ciphertext = cipher
        .encrypt(&XNonce::default(), plaintext.as_slice())
        .map_err(|_| WalletError::Encryption)?;
    Ok(EncryptedNote {
        epk: epk.as_bytes().to_vec(),
        ciphertext,
    })
}

/// Trial-decrypt an output with an incoming viewing key.
///
/// Returns `None` unless the output decrypts *and* the recovered note
/// commits to the on-chain commitment.
pub fn try_decrypt_note(
    ivk: &SecretKey,
    address: &PaymentAddress,
    output: &OutputDescription,
) -> Option<Note> {
    let epk = PublicKey::from_sec1_bytes(&output.note.epk).ok()?;
    let shared = k256::ecdh::diffie_hellman(ivk.to_nonzero_scalar(), epk.as_affine());
    let key = note_key(shared.raw_secret_bytes().as_slice(), &output.note.epk);
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(&XNonce::default(), output.note.ciphertext.as_slice())
            .ok()?,
    );
    let pt = NotePlaintext::try_from_slice(&plaintext).ok()?;
    let note = Note {
        address: *address,
        value: pt.value,
        rcm: pt.rcm,
        memo: pt.memo,
    };
    (note.commitment() == output.cm).then_some(note)
}
