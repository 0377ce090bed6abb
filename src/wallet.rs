//! Wallet adapter contract (spec §4.2): the merchant key, the canonical
//! unsigned payment template, and merchant co-signing.

use bitcoin::{Amount, Network, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut};
use secp256k1::{Keypair, Message, Secp256k1, SecretKey};

use crate::error::{PaymentError, Result};
use crate::script::PaymentChannelRedeemScript;
use crate::transaction::der_with_sighash_all;

/// The merchant-side key and payment-template contract the payment server
/// consumes. Implementations may be backed by a hot key, an HSM, or a
/// remote signer; the server only ever calls these methods while holding
/// its serializing lock, so implementations should not block longer than
/// necessary.
pub trait Wallet: Send + Sync {
    /// The merchant's compressed public key.
    fn get_payout_public_key(&self) -> PublicKey;

    /// True iff `pk` is a key this wallet controls.
    fn validate_public_key(&self, pk: &PublicKey) -> bool;

    /// Whether this wallet operates on testnet (selects the blockchain
    /// provider's URL per spec §6).
    fn testnet(&self) -> bool;

    /// The canonical unsigned shape of the payment tx for a given balance
    /// split, used for strict byte-equality comparison against client
    /// submissions.
    fn create_unsigned_payment_tx(
        &self,
        deposit_tx: &Transaction,
        redeem_script: &PaymentChannelRedeemScript,
        merchant_amount: u64,
        fee: u64,
    ) -> Result<Transaction>;

    /// Replace the merchant-signature placeholder in `tx`'s scriptSig with a
    /// real signature, in place.
    fn sign_half_signed_payment(&self, tx: &mut Transaction, redeem_script: &PaymentChannelRedeemScript) -> Result<()>;
}

/// A single-key secp256k1 reference wallet: the merchant's payout key is a
/// plain `SecretKey` held in memory.
pub struct Secp256k1Wallet {
    secp: Secp256k1<secp256k1::All>,
    keypair: Keypair,
    public_key: PublicKey,
    network: Network,
}

impl Secp256k1Wallet {
    pub fn new(secret_key: SecretKey, network: Network) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let public_key = PublicKey::new(keypair.public_key());
        Self {
            secp,
            keypair,
            public_key,
            network,
        }
    }

    fn p2pkh_script(&self, pubkey: &PublicKey) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&pubkey.pubkey_hash())
    }
}

impl Wallet for Secp256k1Wallet {
    fn get_payout_public_key(&self) -> PublicKey {
        self.public_key
    }

    fn validate_public_key(&self, pk: &PublicKey) -> bool {
        pk == &self.public_key
    }

    fn testnet(&self) -> bool {
        self.network != Network::Bitcoin
    }

    fn create_unsigned_payment_tx(
        &self,
        deposit_tx: &Transaction,
        redeem_script: &PaymentChannelRedeemScript,
        merchant_amount: u64,
        fee: u64,
    ) -> Result<Transaction> {
        let output_index = deposit_tx
            .output
            .iter()
            .position(|out| out.script_pubkey == ScriptBuf::new_p2sh(&redeem_script.hash160()))
            .ok_or_else(|| PaymentError::BadTransaction("deposit does not pay to script hash".into()))?;

        let deposit_amount = deposit_tx.output[output_index].value.to_sat();
        let customer_change = deposit_amount
            .checked_sub(merchant_amount)
            .and_then(|v| v.checked_sub(fee))
            .ok_or_else(|| PaymentError::BadTransaction("channel balance not large enough to make payment".into()))?;

        let merchant_out = TxOut {
            value: Amount::from_sat(merchant_amount),
            script_pubkey: self.p2pkh_script(&redeem_script.merchant_public_key),
        };
        let customer_out = TxOut {
            value: Amount::from_sat(customer_change),
            script_pubkey: self.p2pkh_script(&redeem_script.customer_public_key),
        };

        Ok(Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: bitcoin::OutPoint {
                    txid: deposit_tx.compute_txid(),
                    vout: output_index as u32,
                },
                script_sig: ScriptBuf::new(),
                // A final (`Sequence::MAX`) input sequence makes the redeem
                // script's `OP_CHECKLOCKTIMEVERIFY` branch fail unconditionally
                // per BIP65, regardless of locktime value; this tx's input
                // must stay non-final for the refund branch to ever be usable.
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![merchant_out, customer_out],
        })
    }

    fn sign_half_signed_payment(&self, tx: &mut Transaction, redeem_script: &PaymentChannelRedeemScript) -> Result<()> {
        use crate::transaction::build_fully_signed_script_sig;
        use bitcoin::hashes::Hash;
        use bitcoin::sighash::{EcdsaSighashType, SighashCache};

        let script_sig = tx.input[0].script_sig.clone();
        let items: Vec<_> = script_sig
            .instructions()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PaymentError::Wallet(format!("malformed scriptSig: {e}")))?;
        let customer_sig = match items.first() {
            Some(bitcoin::blockdata::script::Instruction::PushBytes(p)) => p.as_bytes().to_vec(),
            _ => return Err(PaymentError::Wallet("missing customer signature".into())),
        };

        let script_code = redeem_script.to_script();
        let sighash = {
            let mut cache = SighashCache::new(&*tx);
            cache
                .legacy_signature_hash(0, &script_code, EcdsaSighashType::All.to_u32())
                .map_err(|e| PaymentError::Wallet(format!("cannot compute sighash: {e}")))?
        };
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = self.secp.sign_ecdsa(&msg, &self.keypair.secret_key());
        let merchant_sig = der_with_sighash_all(&sig);

        tx.input[0].script_sig = build_fully_signed_script_sig(&customer_sig, &merchant_sig, redeem_script)?;
        Ok(())
    }
}
