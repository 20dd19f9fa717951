//! Signature verifier (spec.md §4.3). One failure mode only: malformed
//! base64, malformed signature bytes, and a genuine cryptographic mismatch
//! all collapse to `SIGNATURE_INVALID` so we never leak a parse-vs-verify
//! distinction to the caller.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::Reason;
use crate::model::Proposal;

/// Canonical bytes of a proposal with the `signature` field stripped —
/// exactly what gets signed and what gets verified.
pub fn signing_bytes(proposal: &Proposal) -> Result<Vec<u8>, Reason> {
    crate::canonical::canonicalize_without_field(proposal, "signature")
        .map(String::into_bytes)
        .map_err(|_| Reason::SignatureInvalid)
}

pub fn verify(proposal: &Proposal, public_key: &VerifyingKey) -> Result<(), Reason> {
    let bytes = signing_bytes(proposal)?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&proposal.signature.sig)
        .map_err(|_| Reason::SignatureInvalid)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| Reason::SignatureInvalid)?;
    public_key
        .verify(&bytes, &sig)
        .map_err(|_| Reason::SignatureInvalid)
}

/// Sign a proposal in place. Used by tests and by any caller assembling a
/// proposal to submit — not part of the validation pipeline itself.
pub fn sign(proposal: &mut Proposal, key_id: &str, signing_key: &SigningKey) -> Result<(), Reason> {
    proposal.signature = crate::model::Signature {
        alg: "ed25519".into(),
        key_id: key_id.into(),
        sig: String::new(),
    };
    let bytes = signing_bytes(proposal)?;
    let sig = signing_key.sign(&bytes);
    proposal.signature.sig = base64::engine::general_purpose::STANDARD.encode(sig.to_bytes());
    Ok(())
}
