//! Half-signed payment transaction helpers (spec §4.1).
//!
//! A payment transaction has exactly one input spending the channel's
//! multisig UTXO, with a scriptSig matching one of two templates:
//!
//! ```text
//! [customer_sig_der||SIGHASH_ALL, OP_1,    redeem_script_bytes]
//! [customer_sig_der||SIGHASH_ALL, OP_TRUE, redeem_script_bytes]
//! ```

use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf, ScriptBuf};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, Transaction};
use secp256k1::{ecdsa, Message, Secp256k1};

use crate::error::{PaymentError, Result};
use crate::script::PaymentChannelRedeemScript;

/// The three scriptSig items of a half-signed payment input, once shape has
/// been verified.
pub struct HalfSignedInput<'a> {
    pub signature_der: &'a [u8],
    pub redeem_script: PaymentChannelRedeemScript,
}

/// Verify the input's scriptSig has exactly three items and the middle one
/// is the merchant-signature placeholder (`OP_1` or `OP_TRUE`, which are the
/// same opcode). Returns the customer signature bytes (DER + sighash byte)
/// and the parsed redeem script (the last item).
pub fn parse_half_signed_input(tx: &Transaction) -> Result<HalfSignedInput<'_>> {
    let script_sig = &tx.input[0].script_sig;
    let items: Vec<Instruction> = script_sig
        .instructions()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| PaymentError::BadTransaction(format!("malformed scriptSig: {e}")))?;

    if items.len() != 3 {
        return Err(PaymentError::BadTransaction(
            "invalid payment channel transaction structure".into(),
        ));
    }

    let signature_der = match &items[0] {
        Instruction::PushBytes(p) => p.as_bytes(),
        _ => {
            return Err(PaymentError::BadTransaction(
                "invalid payment channel transaction structure".into(),
            ))
        }
    };

    let is_placeholder = matches!(items[1], Instruction::Op(op) if op == OP_PUSHNUM_1);
    if !is_placeholder {
        return Err(PaymentError::BadTransaction(
            "invalid payment channel transaction structure".into(),
        ));
    }

    let redeem_script_bytes = match &items[2] {
        Instruction::PushBytes(p) => p.as_bytes(),
        _ => {
            return Err(PaymentError::BadTransaction(
                "invalid payment channel transaction structure".into(),
            ))
        }
    };

    let redeem_script = PaymentChannelRedeemScript::from_bytes(redeem_script_bytes)?;

    Ok(HalfSignedInput {
        signature_der,
        redeem_script,
    })
}

/// Extract just the redeem script, the last item of input 0's scriptSig,
/// without validating scriptSig shape. Used by callers that only need to
/// recover the embedded script (e.g. `sync`, `close`).
pub fn redeem_script_from_input(tx: &Transaction) -> Result<PaymentChannelRedeemScript> {
    let script_sig = &tx.input[0].script_sig;
    let last = script_sig
        .instructions()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PaymentError::BadTransaction(format!("malformed scriptSig: {e}")))?
        .pop()
        .ok_or_else(|| PaymentError::BadTransaction("empty scriptSig".into()))?;

    match last {
        Instruction::PushBytes(p) => PaymentChannelRedeemScript::from_bytes(p.as_bytes()),
        _ => Err(PaymentError::BadTransaction(
            "scriptSig does not end in a script push".into(),
        )),
    }
}

/// Recompute the legacy SIGHASH_ALL digest for input 0, using `redeem_script`
/// as the scriptCode, and verify `signature_der` (DER, without the trailing
/// sighash-type byte) against `public_key`.
pub fn verify_customer_signature(
    tx: &Transaction,
    redeem_script: &PaymentChannelRedeemScript,
    signature_der: &[u8],
    public_key: &PublicKey,
) -> Result<()> {
    let (sig_bytes, _hash_type_byte) = signature_der
        .split_last()
        .ok_or_else(|| PaymentError::BadTransaction("empty signature".into()))?;

    let script_code = redeem_script.to_script();
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(0, &script_code, EcdsaSighashType::All.to_u32())
        .map_err(|e| PaymentError::BadTransaction(format!("cannot compute sighash: {e}")))?;

    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = ecdsa::Signature::from_der(sig_bytes)
        .map_err(|_| PaymentError::BadTransaction("invalid payment signature".into()))?;

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&msg, &sig, &public_key.inner)
        .map_err(|_| PaymentError::BadTransaction("invalid payment signature".into()))
}

/// Rebuild the scriptSig `[sig||hash_type, OP_1, redeem_script]` from a
/// customer signature and a redeem script, for splicing into the wallet's
/// canonical unsigned template (spec §4.5.3 step 12).
pub fn build_half_signed_script_sig(signature_der_with_hashtype: &[u8], redeem_script: &PaymentChannelRedeemScript) -> Result<ScriptBuf> {
    let sig_push = PushBytesBuf::try_from(signature_der_with_hashtype.to_vec())
        .map_err(|_| PaymentError::BadTransaction("signature too large to push".into()))?;
    let script_push = PushBytesBuf::try_from(redeem_script.to_bytes())
        .map_err(|_| PaymentError::BadTransaction("redeem script too large to push".into()))?;

    Ok(Builder::new()
        .push_slice(sig_push)
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(script_push)
        .into_script())
}

/// Rebuild the fully-signed scriptSig `[customer_sig, merchant_sig,
/// redeem_script]` once the merchant has replaced the placeholder with a
/// real signature (spec §4.5.5, §4.5.7 pre-expiry broadcast).
pub fn build_fully_signed_script_sig(
    customer_sig_with_hashtype: &[u8],
    merchant_sig_with_hashtype: &[u8],
    redeem_script: &PaymentChannelRedeemScript,
) -> Result<ScriptBuf> {
    let customer_push = PushBytesBuf::try_from(customer_sig_with_hashtype.to_vec())
        .map_err(|_| PaymentError::BadTransaction("signature too large to push".into()))?;
    let merchant_push = PushBytesBuf::try_from(merchant_sig_with_hashtype.to_vec())
        .map_err(|_| PaymentError::Wallet("merchant signature too large to push".into()))?;
    let script_push = PushBytesBuf::try_from(redeem_script.to_bytes())
        .map_err(|_| PaymentError::BadTransaction("redeem script too large to push".into()))?;

    Ok(Builder::new()
        .push_slice(customer_push)
        .push_slice(merchant_push)
        .push_slice(script_push)
        .into_script())
}

/// Append the SIGHASH_ALL type byte to a freshly produced DER signature.
pub fn der_with_sighash_all(sig: &ecdsa::Signature) -> Vec<u8> {
    let mut out = sig.serialize_der().to_vec();
    out.push(EcdsaSighashType::All.to_u32() as u8);
    out
}
