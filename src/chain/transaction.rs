//! Transaction implementation
//!
//! A minimal signed value transfer. Full validation and the UTXO/account
//! model live outside the networking core; transactions here carry just
//! enough structure to be identified, signed, and shipped between peers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::crypto::{public_key_from_slice, sha256, verify_signature, KeyError, KeyPair};

/// Errors from building or decoding transactions
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Invalid transaction id")]
    InvalidId,
    #[error("Transaction decode failed: {0}")]
    DecodeFailed(#[from] serde_json::Error),
    #[error("Signature verification failed")]
    BadSignature,
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// A 32-byte transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse an id from its raw 32-byte wire form
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransactionError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| TransactionError::InvalidId)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for TxId {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransactionError::InvalidId)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for TxId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A signed transfer of value between two addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id (hash over the signed fields)
    pub id: TxId,
    /// Sender's public key, compressed hex
    pub sender: String,
    /// Recipient address, hex
    pub recipient: String,
    /// Amount transferred
    pub amount: u64,
    /// Sender-chosen nonce
    pub nonce: u64,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Compact ECDSA signature over the id, hex
    pub signature: String,
}

impl Transaction {
    /// Create and sign a new transaction
    pub fn new_signed(
        keys: &KeyPair,
        recipient: &str,
        amount: u64,
        nonce: u64,
    ) -> Result<Self, TransactionError> {
        let sender = keys.public_key_hex();
        let timestamp = Utc::now();
        let id = Self::compute_id(&sender, recipient, amount, nonce, &timestamp);
        let signature = hex::encode(keys.sign(id.as_bytes())?);

        Ok(Self {
            id,
            sender,
            recipient: recipient.to_string(),
            amount,
            nonce,
            timestamp,
            signature,
        })
    }

    fn compute_id(
        sender: &str,
        recipient: &str,
        amount: u64,
        nonce: u64,
        timestamp: &DateTime<Utc>,
    ) -> TxId {
        let data = format!(
            "{}{}{}{}{}",
            sender,
            recipient,
            amount,
            nonce,
            timestamp.timestamp_micros(),
        );
        TxId(sha256(data.as_bytes()))
    }

    /// Verify the id and the sender's signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        let expected = Self::compute_id(
            &self.sender,
            &self.recipient,
            self.amount,
            self.nonce,
            &self.timestamp,
        );
        if expected != self.id {
            return Err(TransactionError::InvalidId);
        }

        let key_bytes = hex::decode(&self.sender).map_err(|_| TransactionError::BadSignature)?;
        let key: PublicKey = public_key_from_slice(&key_bytes)?;
        let sig = hex::decode(&self.signature).map_err(|_| TransactionError::BadSignature)?;

        if !verify_signature(&key, self.id.as_bytes(), &sig)? {
            return Err(TransactionError::BadSignature);
        }
        Ok(())
    }

    /// Serialize the transaction for wire transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a transaction received from the wire
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransactionError> {
        let tx: Transaction = serde_json::from_slice(data)?;
        tx.verify()?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyPair::generate();
        let tx = Transaction::new_signed(&keys, "someone", 42, 0).unwrap();
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn test_wire_round_trip() {
        let keys = KeyPair::generate();
        let tx = Transaction::new_signed(&keys, "someone", 42, 0).unwrap();

        let bytes = tx.to_bytes().unwrap();
        let decoded = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id, tx.id);
        assert_eq!(decoded.amount, 42);
    }

    #[test]
    fn test_tampered_amount_rejected() {
        let keys = KeyPair::generate();
        let mut tx = Transaction::new_signed(&keys, "someone", 42, 0).unwrap();
        tx.amount = 1_000_000;

        assert!(tx.verify().is_err());
        let bytes = serde_json::to_vec(&tx).unwrap();
        assert!(Transaction::from_bytes(&bytes).is_err());
    }
}
