//! Key material and payment addresses.
//!
//! A spending key is a 32-byte seed. Everything else is derived from it with
//! domain-separated BLAKE3:
//! - `ask`: secp256k1 ECDSA key that signs spends
//! - `nk`: nullifier deriving key
//! - `ivk`: secp256k1 scalar used to trial-decrypt incoming notes
//!
//! The payment address is `ivk·G`, compressed.

use core::fmt;
use core::str::FromStr;

use blake3::Hasher;
use bs58::{decode as b58decode, encode as b58encode};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use borsh::{BorshDeserialize, BorshSerialize};
use veil_core::hash32;

use crate::error::WalletError;

const ADDR_PREFIX: u8 = 0x56;
const DS_KEY_ASK: &[u8] = b"VEIL::KEY_ASK::V0";
const DS_KEY_NK: &[u8] = b"VEIL::KEY_NK::V0";
const DS_KEY_IVK: &[u8] = b"VEIL::KEY_IVK::V0";
const EXPORT_SPENDING: &str = "vsk";
const EXPORT_VIEWING: &str = "vfvk";

/// Length of an encoded payment address (compressed point).
pub const ADDRESS_LEN: usize = 33;

/// Secret seed that can spend notes.
#[derive(Clone)]
pub struct SpendingKey {
    seed: Zeroizing<[u8; 32]>,
}

impl SpendingKey {
    /// Fresh random key from the OS RNG.
    pub fn random() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);
        Self { seed }
    }

    /// Key from raw seed bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            seed: Zeroizing::new(bytes),
        }
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.seed
    }

    fn derive(&self, ds: &[u8]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(hash32(ds, &self.seed[..]).0)
    }

    /// Spend authorizing key.
    pub fn spend_authorizing_key(&self) -> Result<SigningKey, WalletError> {
        SigningKey::from_slice(&self.derive(DS_KEY_ASK)[..])
            .map_err(|_| WalletError::InvalidKey("spend authorizing key out of range"))
    }

    /// Viewing half of the key.
    pub fn full_viewing_key(&self) -> FullViewingKey {
        FullViewingKey {
            ivk: *self.derive(DS_KEY_IVK),
            nk: *self.derive(DS_KEY_NK),
        }
    }
}

impl fmt::Debug for SpendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpendingKey(..)")
    }
}

/// Key that can detect incoming notes and their spends, but not spend.
#[derive(Clone, PartialEq, Eq)]
pub struct FullViewingKey {
    ivk: [u8; 32],
    nk: [u8; 32],
}

impl FullViewingKey {
    /// Nullifier deriving key.
    pub fn nk(&self) -> &[u8; 32] {
        &self.nk
    }

    /// Incoming viewing key as a secp256k1 scalar.
    pub fn ivk(&self) -> Result<SecretKey, WalletError> {
        SecretKey::from_slice(&self.ivk)
            .map_err(|_| WalletError::InvalidKey("incoming viewing key out of range"))
    }

    /// Payment address notes to this key are sent to.
    pub fn address(&self) -> Result<PaymentAddress, WalletError> {
        let point = self.ivk()?.public_key().to_encoded_point(true);
        PaymentAddress::from_slice(point.as_bytes())
    }

    fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.ivk);
        out[32..].copy_from_slice(&self.nk);
        out
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() != 64 {
            return Err(WalletError::InvalidKey("viewing key must be 64 bytes"));
        }
        let mut ivk = [0u8; 32];
        let mut nk = [0u8; 32];
        ivk.copy_from_slice(&bytes[..32]);
        nk.copy_from_slice(&bytes[32..]);
        let fvk = Self { ivk, nk };
        fvk.ivk()?;
        Ok(fvk)
    }
}

impl fmt::Debug for FullViewingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FullViewingKey(..)")
    }
}

/// Shielded payment address (compressed secp256k1 point).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct PaymentAddress(pub [u8; ADDRESS_LEN]);

impl PaymentAddress {
    /// Address from raw bytes; the bytes must be a valid curve point.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() != ADDRESS_LEN {
            return Err(WalletError::InvalidAddress("invalid address length"));
        }
        k256::PublicKey::from_sec1_bytes(bytes)
            .map_err(|_| WalletError::InvalidAddress("not a curve point"))?;
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Recipient public key.
    pub fn public_key(&self) -> Result<k256::PublicKey, WalletError> {
        k256::PublicKey::from_sec1_bytes(&self.0)
            .map_err(|_| WalletError::InvalidAddress("not a curve point"))
    }
}

impl fmt::Display for PaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_address(&self.0))
    }
}

impl fmt::Debug for PaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentAddress({self})")
    }
}

impl FromStr for PaymentAddress {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_address(s)
    }
}

/// A key held by a wallet, tagged with what it can do.
#[derive(Clone, Debug)]
pub enum WalletKey {
    /// Can detect, track and spend notes.
    SpendCapable(SpendingKey),
    /// Can detect and track notes only.
    ViewOnly(FullViewingKey),
}

impl WalletKey {
    /// Viewing half of the key.
    pub fn full_viewing_key(&self) -> FullViewingKey {
        match self {
            Self::SpendCapable(sk) => sk.full_viewing_key(),
            Self::ViewOnly(fvk) => fvk.clone(),
        }
    }

    /// Address this key receives at.
    pub fn address(&self) -> Result<PaymentAddress, WalletError> {
        self.full_viewing_key().address()
    }

    /// Whether the key can sign spends.
    pub fn is_spend_capable(&self) -> bool {
        matches!(self, Self::SpendCapable(_))
    }

    /// Spending key, if held.
    pub fn spending_key(&self) -> Result<&SpendingKey, WalletError> {
        match self {
            Self::SpendCapable(sk) => Ok(sk),
            Self::ViewOnly(_) => Err(WalletError::KeyNotSpendCapable),
        }
    }

    /// Export as a kind-prefixed hex string (`vsk…` or `vfvk…`).
    pub fn export(&self) -> Zeroizing<String> {
        Zeroizing::new(match self {
            Self::SpendCapable(sk) => format!("{EXPORT_SPENDING}{}", hex::encode(sk.as_bytes())),
            Self::ViewOnly(fvk) => format!("{EXPORT_VIEWING}{}", hex::encode(fvk.to_bytes())),
        })
    }

    /// Parse an exported key string.
    pub fn import(s: &str) -> Result<Self, WalletError> {
        let s = s.trim();
        // Check the longer prefix first; both start with 'v'.
        if let Some(body) = s.strip_prefix(EXPORT_VIEWING) {
            let bytes = Zeroizing::new(
                hex::decode(body).map_err(|_| WalletError::InvalidKey("invalid hex"))?,
            );
            return Ok(Self::ViewOnly(FullViewingKey::from_slice(&bytes)?));
        }
        if let Some(body) = s.strip_prefix(EXPORT_SPENDING) {
            let bytes = Zeroizing::new(
                hex::decode(body).map_err(|_| WalletError::InvalidKey("invalid hex"))?,
            );
            if bytes.len() != 32 {
                return Err(WalletError::InvalidKey("expected 32-byte spending key"));
            }
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            let sk = SpendingKey::from_bytes(seed);
            sk.spend_authorizing_key()?;
            sk.full_viewing_key().ivk()?;
            return Ok(Self::SpendCapable(sk));
        }
        Err(WalletError::InvalidKey("unknown key prefix"))
    }
}

/// Base58 address with a prefix byte and a 4-byte BLAKE3 checksum.
pub fn encode_address(point: &[u8; ADDRESS_LEN]) -> String {
    let mut payload = Vec::with_capacity(1 + ADDRESS_LEN + 4);
    payload.push(ADDR_PREFIX);
    payload.extend_from_slice(point);
    let checksum = checksum4(&payload);
    payload.extend_from_slice(&checksum);
    b58encode(payload).into_string()
}

/// Parse an address produced by [`encode_address`].
pub fn decode_address(addr: &str) -> Result<PaymentAddress, WalletError> {
    let bytes = b58decode(addr)
        .into_vec()
        .map_err(|_| WalletError::InvalidAddress("invalid base58"))?;
    if bytes.len() != 1 + ADDRESS_LEN + 4 {
        return Err(WalletError::InvalidAddress("invalid address length"));
    }
    if bytes[0] != ADDR_PREFIX {
        return Err(WalletError::InvalidAddress("invalid address prefix"));
    }
    let (payload, checksum) = bytes.split_at(1 + ADDRESS_LEN);
    if checksum4(payload) != checksum[0..4] {
        return Err(WalletError::InvalidAddress("checksum mismatch"));
    }
    PaymentAddress::from_slice(&payload[1..])
}

fn checksum4(data: &[u8]) -> [u8; 4] {
    let mut h = Hasher::new();
    h.update(data);
    let mut out = [0u8; 4];
    h.finalize_xof().fill(&mut out);
    out
}
