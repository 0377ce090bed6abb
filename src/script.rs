//! The payment channel redeem script: a customer/merchant pair of CHECKSIG
//! branches, one CLTV-gated, selected by the merchant-signature slot itself
//! (spec §4.1).
//!
//! ```text
//! <merchant_pubkey> OP_CHECKSIG
//! OP_IF
//!     <customer_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <expiration_time> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     <customer_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! The scriptSig supplies exactly two non-script stack items ahead of the
//! serialized redeem script itself (`[customer_sig, merchant_sig_or_placeholder,
//! redeem_script]`, see `transaction.rs`). P2SH strips the last item and runs
//! the rest against the remaining two. The leading `OP_CHECKSIG` against
//! `merchant_pubkey` consumes the top item and leaves its own boolean result
//! for `OP_IF` to branch on — if the merchant's real signature is present,
//! that check succeeds and the IF branch runs (plain customer-sig check, no
//! locktime wait needed); if the slot holds anything else (the unsigned
//! template's `OP_1` placeholder, or nothing a customer alone can produce),
//! the check fails and the ELSE branch enforces the CLTV-gated refund
//! instead. Either branch ends by checking the one remaining item — the
//! customer's signature — against `customer_pubkey`. No dummy stack element
//! is needed because neither branch uses `OP_CHECKMULTISIG`.

use bitcoin::blockdata::opcodes::all::{OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF};
use bitcoin::blockdata::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::hashes::Hash;
use bitcoin::{PublicKey, ScriptHash};

use crate::error::{PaymentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChannelRedeemScript {
    pub merchant_public_key: PublicKey,
    pub customer_public_key: PublicKey,
    pub expiration_time: i64,
}

impl PaymentChannelRedeemScript {
    pub fn new(merchant_public_key: PublicKey, customer_public_key: PublicKey, expiration_time: i64) -> Self {
        Self {
            merchant_public_key,
            customer_public_key,
            expiration_time,
        }
    }

    /// Deterministic serialization: re-encoding the same three fields always
    /// yields byte-identical output.
    pub fn to_script(&self) -> ScriptBuf {
        Builder::new()
            .push_key(&self.merchant_public_key)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_IF)
            .push_key(&self.customer_public_key)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_slice(push_scriptnum(self.expiration_time))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&self.customer_public_key)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_script().into_bytes()
    }

    pub fn hash160(&self) -> ScriptHash {
        self.to_script().script_hash()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_script(Script::from_bytes(bytes))
    }

    pub fn from_script(script: &Script) -> Result<Self> {
        let ops: Vec<Instruction> = script
            .instructions()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| PaymentError::BadTransaction(format!("malformed redeem script: {e}")))?;

        let bad = || PaymentError::BadTransaction("redeem script does not match template".into());

        if ops.len() != 12 {
            return Err(bad());
        }

        let expect_op = |instr: &Instruction, op| matches!(instr, Instruction::Op(o) if *o == op);
        let push_bytes = |instr: &Instruction| match instr {
            Instruction::PushBytes(p) => Some(p.as_bytes()),
            _ => None,
        };

        let merchant_bytes = push_bytes(&ops[0]).ok_or_else(bad)?;
        if !expect_op(&ops[1], OP_CHECKSIG) || !expect_op(&ops[2], OP_IF) {
            return Err(bad());
        }
        let customer_bytes = push_bytes(&ops[3]).ok_or_else(bad)?;
        if !expect_op(&ops[4], OP_CHECKSIG) || !expect_op(&ops[5], OP_ELSE) {
            return Err(bad());
        }
        let expiration_time = read_scriptnum(push_bytes(&ops[6]).ok_or_else(bad)?);
        if !expect_op(&ops[7], OP_CLTV) || !expect_op(&ops[8], OP_DROP) {
            return Err(bad());
        }
        let customer_bytes_2 = push_bytes(&ops[9]).ok_or_else(bad)?;
        if !expect_op(&ops[10], OP_CHECKSIG) || !expect_op(&ops[11], OP_ENDIF) {
            return Err(bad());
        }
        if customer_bytes != customer_bytes_2 {
            return Err(bad());
        }

        let customer_public_key = PublicKey::from_slice(customer_bytes)
            .map_err(|e| PaymentError::BadTransaction(format!("bad customer pubkey: {e}")))?;
        let merchant_public_key = PublicKey::from_slice(merchant_bytes)
            .map_err(|e| PaymentError::BadTransaction(format!("bad merchant pubkey: {e}")))?;

        Ok(Self {
            merchant_public_key,
            customer_public_key,
            expiration_time,
        })
    }
}

/// Bitcoin's CScriptNum encoding: little-endian magnitude, sign in the high
/// bit of the final byte, minimal length. Hand-rolled rather than routed
/// through `Builder::push_int` so encode/decode are guaranteed inverses of
/// each other for the round-trip check in spec §8.
fn push_scriptnum(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let neg = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().copied().unwrap_or(0) & 0x80 != 0 {
        out.push(if neg { 0x80 } else { 0x00 });
    } else if neg {
        *out.last_mut().unwrap() |= 0x80;
    }
    out
}

fn read_scriptnum(data: &[u8]) -> i64 {
    if data.is_empty() {
        return 0;
    }
    let mut result: i64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        result |= (byte as i64) << (8 * i);
    }
    let last = data[data.len() - 1];
    if last & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (data.len() - 1)));
        -result
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    fn sample_keys() -> (PublicKey, PublicKey) {
        let secp = Secp256k1::new();
        let merchant_sk = secp256k1::SecretKey::from_slice(&[1u8; 32]).unwrap();
        let customer_sk = secp256k1::SecretKey::from_slice(&[2u8; 32]).unwrap();
        let merchant = PublicKey::new(secp256k1::PublicKey::from_secret_key(&secp, &merchant_sk));
        let customer = PublicKey::new(secp256k1::PublicKey::from_secret_key(&secp, &customer_sk));
        (merchant, customer)
    }

    #[test]
    fn round_trips_byte_identical() {
        let (merchant, customer) = sample_keys();
        let script = PaymentChannelRedeemScript::new(merchant, customer, 1_900_000_000);
        let bytes = script.to_bytes();
        let parsed = PaymentChannelRedeemScript::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, script);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn rejects_wrong_item_count() {
        let script = ScriptBuf::from_bytes(vec![0x63, 0x67, 0x68]);
        assert!(PaymentChannelRedeemScript::from_script(&script).is_err());
    }

    #[test]
    fn scriptnum_round_trips_negative_and_edge_values() {
        for n in [0i64, 1, -1, 127, 128, -128, 255, 1_893_456_000, -1_893_456_000] {
            assert_eq!(read_scriptnum(&push_scriptnum(n)), n);
        }
    }
}
