//! Header extra-data framing, signing hashes and signer recovery.
//!
//! V1 blocks frame their extra data as `vanity(32) || addresses || seal(65)`.
//! V2 blocks carry `0x02 || rlp(round, qc)` in the extra field and keep the
//! 65-byte seal in the header's `validator` field. Both versions sign the
//! same header payload: every header field except the seal itself.

use crate::errors::{XDPoSError, XDPoSResult};
use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::{Encodable, Header as RlpHeader};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, SECP256K1,
};
use std::collections::HashSet;
use xdc_primitives::XdcHeader;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the signer seal.
pub const EXTRA_SEAL: usize = 65;

/// Parsed V1 extra data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1ExtraData {
    /// 32-byte vanity prefix.
    pub vanity: [u8; 32],
    /// Validator addresses, present only at checkpoint blocks.
    pub validators: Vec<Address>,
    /// 65-byte ECDSA seal (r, s, v).
    pub seal: [u8; 65],
}

impl V1ExtraData {
    /// Parse V1 extra data. Checkpoint blocks carry the validator list
    /// between vanity and seal; other blocks must carry nothing there.
    pub fn parse(data: &[u8], is_checkpoint: bool) -> XDPoSResult<Self> {
        if data.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(XDPoSError::MissingVanity);
        }

        let mut vanity = [0u8; 32];
        vanity.copy_from_slice(&data[..EXTRA_VANITY]);

        let mut seal = [0u8; 65];
        seal.copy_from_slice(&data[data.len() - EXTRA_SEAL..]);

        let middle = &data[EXTRA_VANITY..data.len() - EXTRA_SEAL];
        let validators = if is_checkpoint {
            if middle.len() % Address::len_bytes() != 0 {
                return Err(XDPoSError::InvalidCheckpointSigners);
            }
            middle.chunks_exact(Address::len_bytes()).map(Address::from_slice).collect()
        } else {
            if !middle.is_empty() {
                return Err(XDPoSError::ExtraDecodeError(
                    "unexpected bytes between vanity and seal".into(),
                ));
            }
            Vec::new()
        };

        Ok(Self { vanity, validators, seal })
    }

    /// Encode back to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            EXTRA_VANITY + self.validators.len() * Address::len_bytes() + EXTRA_SEAL,
        );
        data.extend_from_slice(&self.vanity);
        for validator in &self.validators {
            data.extend_from_slice(validator.as_slice());
        }
        data.extend_from_slice(&self.seal);
        data
    }
}

/// The deterministic signing hash of a header.
///
/// Keccak-256 of the RLP list `(parent_hash, ommers_hash, beneficiary,
/// state_root, transactions_root, receipts_root, logs_bloom, difficulty,
/// number, gas_limit, gas_used, timestamp, extra_data, mix_hash, nonce,
/// validators, penalties[, base_fee])` — every header field except the
/// `validator` seal.
pub fn signing_hash(header: &XdcHeader) -> B256 {
    signing_hash_with_extra(header, &header.extra_data)
}

/// The V1 signing hash: the seal is carried inside `extra_data`, so the
/// trailing 65 bytes are stripped before hashing.
pub fn hash_without_seal(header: &XdcHeader) -> B256 {
    let extra = &header.extra_data;
    let stripped =
        if extra.len() >= EXTRA_SEAL { &extra[..extra.len() - EXTRA_SEAL] } else { &extra[..] };
    signing_hash_with_extra(header, stripped)
}

fn signing_hash_with_extra(header: &XdcHeader, extra: &[u8]) -> B256 {
    let mut payload_length = 0;
    payload_length += header.parent_hash.length();
    payload_length += header.ommers_hash.length();
    payload_length += header.beneficiary.length();
    payload_length += header.state_root.length();
    payload_length += header.transactions_root.length();
    payload_length += header.receipts_root.length();
    payload_length += header.logs_bloom.length();
    payload_length += header.difficulty.length();
    payload_length += header.number.length();
    payload_length += header.gas_limit.length();
    payload_length += header.gas_used.length();
    payload_length += header.timestamp.length();
    payload_length += extra.length();
    payload_length += header.mix_hash.length();
    payload_length += header.nonce.length();
    payload_length += header.validators.length();
    payload_length += header.penalties.length();
    if let Some(base_fee) = header.base_fee_per_gas {
        payload_length += base_fee.length();
    }

    let mut buf = Vec::with_capacity(payload_length + 4);
    RlpHeader { list: true, payload_length }.encode(&mut buf);
    header.parent_hash.encode(&mut buf);
    header.ommers_hash.encode(&mut buf);
    header.beneficiary.encode(&mut buf);
    header.state_root.encode(&mut buf);
    header.transactions_root.encode(&mut buf);
    header.receipts_root.encode(&mut buf);
    header.logs_bloom.encode(&mut buf);
    header.difficulty.encode(&mut buf);
    header.number.encode(&mut buf);
    header.gas_limit.encode(&mut buf);
    header.gas_used.encode(&mut buf);
    header.timestamp.encode(&mut buf);
    extra.encode(&mut buf);
    header.mix_hash.encode(&mut buf);
    header.nonce.encode(&mut buf);
    header.validators.encode(&mut buf);
    header.penalties.encode(&mut buf);
    if let Some(base_fee) = header.base_fee_per_gas {
        base_fee.encode(&mut buf);
    }

    keccak256(&buf)
}

/// Recover the signer address from a 65-byte recoverable signature over
/// `hash`. The address is the low 20 bytes of the keccak of the 64-byte
/// public key.
pub fn ecrecover(hash: &B256, signature: &[u8]) -> XDPoSResult<Address> {
    if signature.len() != 65 {
        return Err(XDPoSError::InvalidSignatureFormat);
    }

    let v = signature[64];
    // Accept raw recovery ids (0/1), legacy (27/28) and EIP-155 values.
    let recovery_id = if v >= 35 {
        (v - 35) % 2
    } else if v >= 27 {
        v - 27
    } else {
        v
    };
    let recovery_id = RecoveryId::from_i32(recovery_id as i32)
        .map_err(|_| XDPoSError::InvalidSignatureFormat)?;

    let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| XDPoSError::InvalidSignatureFormat)?;
    let message = Message::from_digest_slice(hash.as_slice())
        .map_err(|_| XDPoSError::InvalidSignatureFormat)?;

    let public_key = SECP256K1
        .recover_ecdsa(&message, &sig)
        .map_err(|_| XDPoSError::SignatureVerificationFailed)?;

    let pubkey_bytes = public_key.serialize_uncompressed();
    let pubkey_hash = keccak256(&pubkey_bytes[1..]);
    Ok(Address::from_slice(&pubkey_hash[12..]))
}

/// Extract the seal from V1 extra data.
pub fn extract_v1_seal(header: &XdcHeader) -> XDPoSResult<[u8; 65]> {
    let extra = &header.extra_data;
    if extra.len() < EXTRA_SEAL {
        return Err(XDPoSError::MissingSignature);
    }
    let mut seal = [0u8; 65];
    seal.copy_from_slice(&extra[extra.len() - EXTRA_SEAL..]);
    Ok(seal)
}

/// Recover the producer of a V1 block from the seal inside its extra data.
pub fn recover_v1_signer(header: &XdcHeader) -> XDPoSResult<Address> {
    let seal = extract_v1_seal(header)?;
    ecrecover(&hash_without_seal(header), &seal)
}

/// Recover the producer of a V2 block from the seal in its `validator` field.
pub fn recover_v2_signer(header: &XdcHeader) -> XDPoSResult<Address> {
    if header.validator.len() != EXTRA_SEAL {
        return Err(XDPoSError::MissingSignature);
    }
    ecrecover(&signing_hash(header), &header.validator)
}

/// Deduplicate signatures by raw bytes. Returns `(unique, duplicates)`;
/// callers log duplicates but never fail on them.
pub fn unique_signatures(signatures: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = Vec::new();

    for sig in signatures {
        if seen.insert(keccak256(sig)) {
            unique.push(sig.clone());
        } else {
            duplicates.push(sig.clone());
        }
    }

    (unique, duplicates)
}

/// Sign `hash` with a raw 32-byte secret key, producing a 65-byte
/// recoverable signature with a raw recovery id. Used by tests and the
/// default in-process signer.
pub fn sign_hash(secret: &[u8; 32], hash: &B256) -> XDPoSResult<[u8; 65]> {
    let secret_key =
        secp256k1::SecretKey::from_slice(secret).map_err(|_| XDPoSError::InvalidSignatureFormat)?;
    let message = Message::from_digest_slice(hash.as_slice())
        .map_err(|_| XDPoSError::InvalidSignatureFormat)?;

    let sig = SECP256K1.sign_ecdsa_recoverable(&message, &secret_key);
    let (recovery_id, bytes) = sig.serialize_compact();

    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&bytes);
    out[64] = recovery_id.to_i32() as u8;
    Ok(out)
}

/// The address controlled by a raw 32-byte secret key.
pub fn address_of_secret(secret: &[u8; 32]) -> XDPoSResult<Address> {
    let secret_key =
        secp256k1::SecretKey::from_slice(secret).map_err(|_| XDPoSError::InvalidSignatureFormat)?;
    let public_key = secp256k1::PublicKey::from_secret_key(SECP256K1, &secret_key);
    let pubkey_hash = keccak256(&public_key.serialize_uncompressed()[1..]);
    Ok(Address::from_slice(&pubkey_hash[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    #[test]
    fn parse_checkpoint_extra_data() {
        let val1 = Address::with_last_byte(1);
        let val2 = Address::with_last_byte(2);

        let mut data = vec![0u8; EXTRA_VANITY];
        data[0] = 0xaa;
        data.extend_from_slice(val1.as_slice());
        data.extend_from_slice(val2.as_slice());
        let mut seal = vec![0u8; EXTRA_SEAL];
        seal[0] = 0xff;
        data.extend_from_slice(&seal);

        let parsed = V1ExtraData::parse(&data, true).unwrap();
        assert_eq!(parsed.vanity[0], 0xaa);
        assert_eq!(parsed.validators, vec![val1, val2]);
        assert_eq!(parsed.seal[0], 0xff);
    }

    #[test]
    fn parse_rejects_malformed_extra() {
        // Too short for vanity + seal.
        assert!(matches!(V1ExtraData::parse(&[0u8; 50], false), Err(XDPoSError::MissingVanity)));

        // Checkpoint with a validator section not divisible by 20.
        let mut data = vec![0u8; EXTRA_VANITY];
        data.extend_from_slice(&[0u8; 25]);
        data.extend_from_slice(&[0u8; EXTRA_SEAL]);
        assert!(matches!(
            V1ExtraData::parse(&data, true),
            Err(XDPoSError::InvalidCheckpointSigners)
        ));
    }

    #[test]
    fn extra_encode_roundtrip() {
        let original = V1ExtraData {
            vanity: [0xaa; 32],
            validators: vec![Address::with_last_byte(1), Address::with_last_byte(2)],
            seal: [0xff; 65],
        };
        let decoded = V1ExtraData::parse(&original.encode(), true).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn signing_hash_excludes_seal_field() {
        let base = XdcHeader { number: 100, ..Default::default() };
        let mut sealed = base.clone();
        sealed.validator = Bytes::from(vec![0xff; 65]);

        // The seal must not change what was signed.
        assert_eq!(signing_hash(&base), signing_hash(&sealed));

        // But the validators field is part of the signed payload.
        let mut with_validators = base.clone();
        with_validators.validators = Bytes::from(vec![1u8; 20]);
        assert_ne!(signing_hash(&base), signing_hash(&with_validators));
    }

    #[test]
    fn v1_seal_recovery_roundtrip() {
        let secret = [7u8; 32];
        let expected = address_of_secret(&secret).unwrap();

        let mut header = XdcHeader { number: 100, ..Default::default() };
        header.extra_data = Bytes::from(vec![0u8; EXTRA_VANITY]);

        // Sign the seal-less payload, then append the seal.
        let sig = sign_hash(&secret, &hash_without_seal(&header)).unwrap();
        let mut extra = header.extra_data.to_vec();
        extra.extend_from_slice(&sig);
        header.extra_data = extra.into();

        assert_eq!(recover_v1_signer(&header).unwrap(), expected);
    }

    #[test]
    fn v2_seal_recovery_roundtrip() {
        let secret = [9u8; 32];
        let expected = address_of_secret(&secret).unwrap();

        let mut header = XdcHeader { number: 1000, ..Default::default() };
        let sig = sign_hash(&secret, &signing_hash(&header)).unwrap();
        header.validator = Bytes::from(sig.to_vec());

        assert_eq!(recover_v2_signer(&header).unwrap(), expected);
    }

    #[test]
    fn ecrecover_accepts_legacy_v_values() {
        let secret = [3u8; 32];
        let hash = keccak256(b"payload");
        let mut sig = sign_hash(&secret, &hash).unwrap();
        let expected = address_of_secret(&secret).unwrap();

        assert_eq!(ecrecover(&hash, &sig).unwrap(), expected);

        // Same signature with a 27/28-style recovery id.
        sig[64] += 27;
        assert_eq!(ecrecover(&hash, &sig).unwrap(), expected);
    }

    #[test]
    fn ecrecover_rejects_bad_length() {
        assert!(ecrecover(&B256::ZERO, &[0u8; 64]).is_err());
    }

    #[test]
    fn unique_signatures_split() {
        let sig1 = vec![1, 2, 3];
        let sig2 = vec![4, 5, 6];
        let (unique, duplicates) = unique_signatures(&[sig1.clone(), sig2, sig1]);

        assert_eq!(unique.len(), 2);
        assert_eq!(duplicates.len(), 1);
    }
}
