//! Static authenticator identity (spec.md §3/§4.E getInfo).

/// 16-byte AAGUID, reported verbatim in `getInfo` and in every
/// `AttestedCredentialData`. The teacher's embedded-authenticator ancestor
/// used a literal ASCII placeholder (`b"AAGUID0123456789"`); this crate's
/// identity is just as arbitrary but distinct, since it names a different
/// authenticator model.
pub const AAGUID: [u8; 16] = *b"ctap2-core-v0.1\0";
