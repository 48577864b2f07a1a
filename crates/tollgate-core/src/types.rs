use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Token value in the smallest on-chain unit.
pub type Amount = u128;

/// Numeric chain identifier (EIP-155 style).
pub type ChainId = i64;

/// Hermes operators are identified by their contract address.
pub type HermesId = Address;

/// Hash of an on-chain transaction.
pub type TxHash = H256;

/// Hashlock an invoice publishes and a promise must reference.
pub type Hashlock = H256;

/// Identifier of one consumer agreement (one paid session).
pub type AgreementId = u64;

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], CoreError> {
    let trimmed = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let bytes = hex::decode(trimmed)
        .map_err(|e| CoreError::InvalidHex(format!("{}: {}", s, e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        CoreError::InvalidHex(format!("expected {} bytes, got {}", N, bytes.len()))
    })
}

/// 20-byte account / contract address, rendered as `0x`-prefixed lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// Create from a slice of exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            CoreError::InvalidAddress(format!("expected 20 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Parse from hex, with or without the `0x` prefix. Case-insensitive.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        decode_fixed::<20>(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidAddress(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// 32-byte hash, rendered as `0x`-prefixed lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        decode_fixed::<32>(s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({})", self)
    }
}

impl FromStr for H256 {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for H256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An address-identified actor (consumer or provider).
///
/// Identities are keys, not mutable objects: registration state lives on
/// chain and is looked up per chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Address);

impl Identity {
    pub fn from_address(address: Address) -> Self {
        Self(address)
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        Address::from_hex(s).map(Self)
    }

    pub fn address(&self) -> Address {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl FromStr for Identity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Cache and lock key for a (chain, identity, hermes) channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub hermes_id: HermesId,
}

impl ChannelKey {
    pub fn new(chain_id: ChainId, identity: Identity, hermes_id: HermesId) -> Self {
        Self {
            chain_id,
            identity,
            hermes_id,
        }
    }

    /// Stable string form, used as a storage key.
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.chain_id, self.identity, self.hermes_id)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// On-chain registration lifecycle of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Unregistered,
    InProgress,
    Registered,
    RegistrationError,
}

impl RegistrationStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "Unregistered"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Registered => write!(f, "Registered"),
            Self::RegistrationError => write!(f, "RegistrationError"),
        }
    }
}

/// A provider-issued billing statement for a session's accrued usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Session-scoped agreement identifier.
    pub agreement_id: u64,
    /// Cumulative amount owed for the whole agreement so far.
    pub agreement_total: Amount,
    /// Fee the transactor charges for settling this value.
    pub transactor_fee: Amount,
    /// Identity that issued the invoice.
    pub provider: Identity,
    /// Chain the payment channel lives on.
    pub chain_id: ChainId,
    /// BLAKE3 digest of the fields above.
    pub hash: Hashlock,
}

impl Invoice {
    /// Build an invoice and compute its hash.
    pub fn new(
        agreement_id: u64,
        agreement_total: Amount,
        transactor_fee: Amount,
        provider: Identity,
        chain_id: ChainId,
    ) -> Self {
        let hash = Self::compute_hash(agreement_id, agreement_total, transactor_fee, &provider, chain_id);
        Self {
            agreement_id,
            agreement_total,
            transactor_fee,
            provider,
            chain_id,
            hash,
        }
    }

    fn compute_hash(
        agreement_id: u64,
        agreement_total: Amount,
        transactor_fee: Amount,
        provider: &Identity,
        chain_id: ChainId,
    ) -> Hashlock {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tollgate-invoice-v1");
        hasher.update(&agreement_id.to_be_bytes());
        hasher.update(&agreement_total.to_be_bytes());
        hasher.update(&transactor_fee.to_be_bytes());
        hasher.update(provider.address().as_bytes());
        hasher.update(&chain_id.to_be_bytes());
        H256(*hasher.finalize().as_bytes())
    }

    /// Whether `hash` matches the invoice contents.
    pub fn is_hash_valid(&self) -> bool {
        self.hash
            == Self::compute_hash(
                self.agreement_id,
                self.agreement_total,
                self.transactor_fee,
                &self.provider,
                self.chain_id,
            )
    }
}

/// A consumer-signed acknowledgment of cumulative payment for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub chain_id: ChainId,
    /// Provider's channel the promise pays into.
    pub channel_id: Address,
    /// Total owed to date for the channel. Never a delta.
    pub amount: Amount,
    /// Hermes fee included in the promise.
    pub fee: Amount,
    /// Hash of the invoice being paid.
    pub hashlock: Hashlock,
    /// Ed25519 signature over [`Promise::signing_payload`].
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Promise {
    /// Build an unsigned promise.
    pub fn new(
        chain_id: ChainId,
        channel_id: Address,
        amount: Amount,
        fee: Amount,
        hashlock: Hashlock,
    ) -> Self {
        Self {
            chain_id,
            channel_id,
            amount,
            fee,
            hashlock,
            signature: Vec::new(),
        }
    }

    /// Canonical bytes covered by the consumer's signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(19 + 8 + 20 + 16 + 16 + 32);
        buf.extend_from_slice(b"tollgate-promise-v1");
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(self.channel_id.as_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(self.hashlock.as_bytes());
        buf
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Snapshot of a provider's channel with one hermes on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HermesChannel {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub hermes_id: HermesId,
    /// Deterministic channel contract address.
    pub channel_id: Address,
    /// Last confirmed on-chain channel balance.
    pub onchain_balance: Amount,
    /// Cumulative promise value already settled on chain.
    pub settled: Amount,
    /// Latest accepted promise of every agreement paying into the channel.
    #[serde(default)]
    pub promises: BTreeMap<AgreementId, Promise>,
    /// Where settled funds are paid out.
    pub beneficiary: Address,
}

impl HermesChannel {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.chain_id, self.identity, self.hermes_id)
    }

    /// Cumulative amount promised so far, across all agreements.
    pub fn promised(&self) -> Amount {
        self.promises
            .values()
            .fold(0, |total: Amount, p| total.saturating_add(p.amount))
    }

    /// Promised amount of one agreement.
    pub fn promised_by(&self, agreement_id: AgreementId) -> Amount {
        self.promises.get(&agreement_id).map(|p| p.amount).unwrap_or(0)
    }

    /// Record `promise` for `agreement_id` unless it does not raise that
    /// agreement's amount. Returns whether the channel changed.
    pub fn accept_promise(&mut self, agreement_id: AgreementId, promise: &Promise) -> bool {
        if promise.amount <= self.promised_by(agreement_id) {
            return false;
        }
        self.promises.insert(agreement_id, promise.clone());
        true
    }

    /// Promised value not yet settled on chain.
    pub fn unsettled(&self) -> Amount {
        self.promised().saturating_sub(self.settled)
    }

    /// `onchain_balance + promised - settled`, never negative.
    pub fn balance(&self) -> Amount {
        self.onchain_balance.saturating_add(self.unsettled())
    }

    /// Whether the unsettled share of the balance reached `threshold`.
    pub fn needs_settling(&self, threshold: f64) -> bool {
        let unsettled = self.unsettled();
        if unsettled == 0 {
            return false;
        }
        (unsettled as f64) >= threshold * (self.balance() as f64)
    }
}

/// Audit record of one completed on-chain settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementHistoryEntry {
    pub tx_hash: TxHash,
    pub provider_id: Identity,
    pub hermes_id: HermesId,
    pub channel_address: Address,
    pub beneficiary: Address,
    pub amount: Amount,
    pub settled_at: DateTime<Utc>,
    pub fees: Amount,
}

/// State of an in-flight beneficiary change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeneficiaryChangeState {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for BeneficiaryChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeneficiaryChangeStatus {
    pub state: BeneficiaryChangeState,
    /// Requested beneficiary.
    pub beneficiary: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BeneficiaryChangeStatus {
    pub fn pending(beneficiary: Address) -> Self {
        Self {
            state: BeneficiaryChangeState::Pending,
            beneficiary,
            error: None,
        }
    }
}

/// Fees charged by the transactor and the hermes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactorFees {
    pub registration: Amount,
    pub settlement: Amount,
    /// Hermes fee in basis points.
    pub hermes: u16,
}
