//! Authorizing spends. The harness only decides *whether* an input needs a signature;
//! producing it is delegated to a [SpendAuthorizer](SpendAuthorizer).
use bitcoin::{
    ecdsa,
    hashes::Hash,
    opcodes::OP_TRUE,
    script::{Builder, PushBytesBuf},
    secp256k1::{All, Message, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    PublicKey, Script, ScriptBuf, Transaction, TxOut,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("Invalid secret key: {0}")]
    InvalidKey(String),
    #[error("Transaction has no input {0}")]
    MissingInput(usize),
    #[error("Failed to compute the signature hash: {0}")]
    Sighash(String),
}

/// Produces the authorization (script signature) for one input of a transaction.
pub trait SpendAuthorizer: Send + Sync {
    /// Fills in the `script_sig` of `tx.input[input_index]`, which spends `spent`.
    fn authorize(
        &self,
        tx: &mut Transaction,
        input_index: usize,
        spent: &TxOut,
    ) -> Result<(), AuthorizationError>;
}

/// An output is anyone-can-spend when its script starts with `OP_TRUE`; everything else
/// needs a real signature.
pub fn requires_authorization(script_pubkey: &Script) -> bool {
    script_pubkey.as_bytes().first() != Some(&OP_TRUE.to_u8())
}

/// Authorizes `tx.input[input_index]`: anyone-can-spend outputs get an empty script
/// signature, all others are handed to `authorizer`.
pub fn authorize_input(
    authorizer: &dyn SpendAuthorizer,
    tx: &mut Transaction,
    input_index: usize,
    spent: &TxOut,
) -> Result<(), AuthorizationError> {
    if requires_authorization(&spent.script_pubkey) {
        return authorizer.authorize(tx, input_index, spent);
    }
    let input = tx
        .input
        .get_mut(input_index)
        .ok_or(AuthorizationError::MissingInput(input_index))?;
    input.script_sig = ScriptBuf::new();
    Ok(())
}

/// Signs legacy pay-to-pubkey spends with a single secp256k1 key. The same key is the
/// default recipient of every coinbase the harness creates.
pub struct KeySigner {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeySigner {
    /// Creates a signer with a fresh random key.
    pub fn generate() -> Self {
        loop {
            if let Ok(signer) = Self::from_secret_bytes(&rand::random::<[u8; 32]>()) {
                return signer;
            }
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, AuthorizationError> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|err| AuthorizationError::InvalidKey(err.to_string()))?;
        let public_key = PublicKey::new(secret_key.public_key(&secp));
        Ok(Self {
            secp,
            secret_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// The `<pubkey> OP_CHECKSIG` script this signer can spend.
    pub fn p2pk_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2pk(&self.public_key)
    }
}

impl SpendAuthorizer for KeySigner {
    fn authorize(
        &self,
        tx: &mut Transaction,
        input_index: usize,
        spent: &TxOut,
    ) -> Result<(), AuthorizationError> {
        if input_index >= tx.input.len() {
            return Err(AuthorizationError::MissingInput(input_index));
        }
        let sighash_type = EcdsaSighashType::All;
        let sighash = SighashCache::new(&*tx)
            .legacy_signature_hash(input_index, &spent.script_pubkey, sighash_type.to_u32())
            .map_err(|err| AuthorizationError::Sighash(err.to_string()))?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&message, &self.secret_key),
            sighash_type,
        };
        let push = PushBytesBuf::try_from(signature.to_vec())
            .map_err(|err| AuthorizationError::Sighash(err.to_string()))?;
        tx.input[input_index].script_sig = Builder::new().push_slice(push).into_script();
        Ok(())
    }
}
