//! SRP-6a engine, server and client halves.
//!
//! # Protocol parameters
//! - Group: RFC 5054 2048-bit (`N` 256 bytes, `g = 2`)
//! - Hash: SHA-256
//! - Multiplier: `k = H(N ‖ PAD(g))`
//! - Private key: `x = H(salt ‖ H(identity ":" password))`
//! - Proofs: `M1 = H(H(N) ⊕ H(g) ‖ H(I) ‖ salt ‖ PAD(A) ‖ PAD(B) ‖ K)`,
//!   `M2 = H(PAD(A) ‖ M1 ‖ K)` where `K = H(PAD(S))`
//!
//! All wire values are lowercase hex; ephemerals are padded to the group
//! size (256 bytes) before hashing. The server never sees the password and
//! the client never sees the verifier.

use num_bigint::BigUint;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use srp::groups::G_2048;
use subtle::ConstantTimeEq as _;

/// Length of `N` in bytes; ephemerals are padded to this for hashing.
const GROUP_LEN: usize = 256;
/// Random salt length for fresh registrations.
const SALT_LEN: usize = 16;
/// Random ephemeral secret length.
const EPHEMERAL_LEN: usize = 64;

/// Errors of the SRP engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SrpError {
    /// A wire value was not valid hex.
    #[error(transparent)]
    InvalidHex(#[from] hex::FromHexError),
    /// A public ephemeral reduced to zero mod N (reflection attack).
    #[error("public ephemeral is invalid")]
    InvalidEphemeral,
    /// The peer's proof did not match.
    #[error("proof mismatch")]
    ProofMismatch,
}

/// Salt and verifier produced at registration time.
///
/// The verifier is safe to persist server-side; the password cannot be
/// recovered from it without solving the discrete log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Random salt, hex.
    pub salt: String,
    /// `v = g^x mod N`, hex, padded to the group size.
    pub verifier: String,
}

/// Derives registration credentials for `identity` with a fresh random salt.
pub fn register_credentials(identity: &str, password: &str) -> Credentials {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    credentials_with_salt(identity, password, &salt)
}

/// Derives registration credentials with a caller-provided salt.
pub fn credentials_with_salt(identity: &str, password: &str, salt: &[u8]) -> Credentials {
    let x = private_key(salt, identity, password);
    let v = G_2048.g.modpow(&x, &G_2048.n);
    Credentials {
        salt: hex::encode(salt),
        verifier: hex::encode(pad(&v)),
    }
}

/// Deterministic fake credentials for an identity that does not exist.
///
/// Unknown identities must be indistinguishable from wrong passwords on the
/// wire, so the handshake runs against these instead of short-circuiting.
/// The same identity always maps to the same salt and verifier.
pub fn decoy_credentials(identity: &str) -> Credentials {
    let salt = Sha256::digest([b"homelink-decoy-salt:", identity.as_bytes()].concat());
    let x = BigUint::from_bytes_be(&Sha256::digest(
        [b"homelink-decoy-x:", identity.as_bytes()].concat(),
    ));
    let v = G_2048.g.modpow(&x, &G_2048.n);
    Credentials {
        salt: hex::encode(&salt[..SALT_LEN]),
        verifier: hex::encode(pad(&v)),
    }
}

/// Server-side state between the challenge and the verify step.
///
/// Exists per live handshake only; dropped as soon as the proof is checked.
pub struct ServerHandshake {
    identity: String,
    salt: Vec<u8>,
    verifier: BigUint,
    b: BigUint,
    b_pub: BigUint,
}

/// Outcome of a successful server-side verification.
pub struct ServerSession {
    /// Server proof `M2`, hex, to be sent to the client.
    pub m2: String,
    /// The raw shared secret `K` (32 bytes). Feed through
    /// [`crate::crypto::derive_session_key`].
    pub secret: [u8; 32],
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("m2", &self.m2)
            .finish_non_exhaustive()
    }
}

impl ServerHandshake {
    /// Starts a handshake from stored credentials, picking a random `b` and
    /// computing `B = (kv + g^b) mod N`.
    pub fn start(identity: &str, salt_hex: &str, verifier_hex: &str) -> Result<Self, SrpError> {
        let salt = hex::decode(salt_hex)?;
        let verifier = BigUint::from_bytes_be(&hex::decode(verifier_hex)?);
        let mut b_bytes = [0u8; EPHEMERAL_LEN];
        rand::rngs::OsRng.fill_bytes(&mut b_bytes);
        let b = BigUint::from_bytes_be(&b_bytes);
        let b_pub =
            (compute_k() * &verifier + G_2048.g.modpow(&b, &G_2048.n)) % &G_2048.n;
        Ok(Self {
            identity: identity.to_owned(),
            salt,
            verifier,
            b,
            b_pub,
        })
    }

    /// The salt to send with the challenge, hex.
    pub fn salt(&self) -> String {
        hex::encode(&self.salt)
    }

    /// Server public ephemeral `B`, hex, padded.
    pub fn public_ephemeral(&self) -> String {
        hex::encode(pad(&self.b_pub))
    }

    /// Checks the client proof and, on success, produces `M2` and the shared
    /// secret. Consumes the handshake; `b` never survives this call.
    pub fn verify(self, a_hex: &str, m1_hex: &str) -> Result<ServerSession, SrpError> {
        let a_pub = BigUint::from_bytes_be(&hex::decode(a_hex)?);
        if &a_pub % &G_2048.n == BigUint::default() {
            return Err(SrpError::InvalidEphemeral);
        }
        let client_m1 = hex::decode(m1_hex)?;

        let a_bytes = pad(&a_pub);
        let b_bytes = pad(&self.b_pub);
        let u = compute_u(&a_bytes, &b_bytes);

        // S = (A * v^u)^b mod N
        let base = (&a_pub * self.verifier.modpow(&u, &G_2048.n)) % &G_2048.n;
        let s = base.modpow(&self.b, &G_2048.n);
        let secret = session_secret(&s);

        let expected_m1 = compute_m1(&a_bytes, &b_bytes, &self.salt, &self.identity, &secret);
        if expected_m1.ct_eq(client_m1.as_slice()).unwrap_u8() != 1 {
            return Err(SrpError::ProofMismatch);
        }

        let m2 = compute_m2(&a_bytes, &expected_m1, &secret);
        Ok(ServerSession {
            m2: hex::encode(m2),
            secret,
        })
    }
}

/// Client-side state between hello and the server challenge.
pub struct ClientHandshake {
    identity: String,
    password: String,
    a: BigUint,
    a_pub: BigUint,
}

/// Outcome of the client-side proof computation.
pub struct ClientSession {
    /// Client proof `M1`, hex, to be sent to the server.
    pub m1: String,
    /// The raw shared secret `K` (32 bytes).
    pub secret: [u8; 32],
    a_bytes: Vec<u8>,
    m1_bytes: [u8; 32],
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("m1", &self.m1)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Verifies the server proof `M2`, confirming mutual authentication.
    pub fn verify_server(&self, m2_hex: &str) -> Result<(), SrpError> {
        let server_m2 = hex::decode(m2_hex)?;
        let expected = compute_m2(&self.a_bytes, &self.m1_bytes, &self.secret);
        if expected.ct_eq(server_m2.as_slice()).unwrap_u8() != 1 {
            return Err(SrpError::ProofMismatch);
        }
        Ok(())
    }
}

impl ClientHandshake {
    /// Starts a client handshake, picking a random `a` and computing
    /// `A = g^a mod N`.
    pub fn new(identity: &str, password: &str) -> Self {
        let mut a_bytes = [0u8; EPHEMERAL_LEN];
        rand::rngs::OsRng.fill_bytes(&mut a_bytes);
        Self::with_ephemeral(identity, password, &a_bytes)
    }

    /// Starts a client handshake with a caller-provided ephemeral secret.
    pub fn with_ephemeral(identity: &str, password: &str, a_bytes: &[u8]) -> Self {
        let a = BigUint::from_bytes_be(a_bytes);
        let a_pub = G_2048.g.modpow(&a, &G_2048.n);
        Self {
            identity: identity.to_owned(),
            password: password.to_owned(),
            a,
            a_pub,
        }
    }

    /// Client public ephemeral `A`, hex, padded.
    pub fn public_ephemeral(&self) -> String {
        hex::encode(pad(&self.a_pub))
    }

    /// Processes the server challenge, producing `M1` and the shared secret.
    ///
    /// Rejects a server ephemeral that reduces to zero mod N.
    pub fn process_challenge(
        self,
        salt_hex: &str,
        b_hex: &str,
    ) -> Result<ClientSession, SrpError> {
        let b_pub = BigUint::from_bytes_be(&hex::decode(b_hex)?);
        if &b_pub % &G_2048.n == BigUint::default() {
            return Err(SrpError::InvalidEphemeral);
        }
        let salt = hex::decode(salt_hex)?;

        let a_bytes = pad(&self.a_pub);
        let b_bytes = pad(&b_pub);
        let u = compute_u(&a_bytes, &b_bytes);
        let x = private_key(&salt, &self.identity, &self.password);

        // S = (B - k*g^x)^(a + u*x) mod N
        let kg_x = (compute_k() * G_2048.g.modpow(&x, &G_2048.n)) % &G_2048.n;
        let base = ((&G_2048.n + &b_pub) - kg_x) % &G_2048.n;
        let exp = (&u * &x) + &self.a;
        let s = base.modpow(&exp, &G_2048.n);
        let secret = session_secret(&s);

        let m1_bytes = compute_m1(&a_bytes, &b_bytes, &salt, &self.identity, &secret);
        Ok(ClientSession {
            m1: hex::encode(m1_bytes),
            secret,
            a_bytes,
            m1_bytes,
        })
    }
}

/// `x = H(salt ‖ H(identity ":" password))`
fn private_key(salt: &[u8], identity: &str, password: &str) -> BigUint {
    let mut inner = Sha256::new();
    inner.update(identity.as_bytes());
    inner.update(b":");
    inner.update(password.as_bytes());
    let inner = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(salt);
    outer.update(inner);
    BigUint::from_bytes_be(&outer.finalize())
}

/// `K = H(PAD(S))`
fn session_secret(s: &BigUint) -> [u8; 32] {
    Sha256::digest(pad(s)).into()
}

/// `k = H(N ‖ PAD(g))`
fn compute_k() -> BigUint {
    let mut hasher = Sha256::new();
    hasher.update(G_2048.n.to_bytes_be());
    hasher.update(pad(&G_2048.g));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// `u = H(PAD(A) ‖ PAD(B))`
fn compute_u(a_pub: &[u8], b_pub: &[u8]) -> BigUint {
    let mut hasher = Sha256::new();
    hasher.update(a_pub);
    hasher.update(b_pub);
    BigUint::from_bytes_be(&hasher.finalize())
}

/// `M1 = H(H(N) ⊕ H(g) ‖ H(I) ‖ salt ‖ A ‖ B ‖ K)`; `H(g)` is unpadded.
fn compute_m1(a_pub: &[u8], b_pub: &[u8], salt: &[u8], identity: &str, key: &[u8]) -> [u8; 32] {
    let h_n = Sha256::digest(G_2048.n.to_bytes_be());
    let h_g = Sha256::digest(G_2048.g.to_bytes_be());
    let xored: Vec<u8> = h_n.iter().zip(h_g.iter()).map(|(a, b)| a ^ b).collect();

    let mut hasher = Sha256::new();
    hasher.update(&xored);
    hasher.update(Sha256::digest(identity.as_bytes()));
    hasher.update(salt);
    hasher.update(a_pub);
    hasher.update(b_pub);
    hasher.update(key);
    hasher.finalize().into()
}

/// `M2 = H(A ‖ M1 ‖ K)`
fn compute_m2(a_pub: &[u8], m1: &[u8], key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a_pub);
    hasher.update(m1);
    hasher.update(key);
    hasher.finalize().into()
}

/// Left-pads a group element to [`GROUP_LEN`] bytes.
fn pad(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= GROUP_LEN {
        bytes
    } else {
        let mut padded = vec![0u8; GROUP_LEN - bytes.len()];
        padded.extend(bytes);
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_session_key;

    const IDENTITY: &str = "alice";
    const PASSWORD: &str = "correct horse battery staple";
    const SALT_HEX: &str = "00112233445566778899aabbccddeeff";

    fn run_handshake(password: &str) -> (Result<ServerSession, SrpError>, ClientSession) {
        let creds = credentials_with_salt(IDENTITY, PASSWORD, &hex::decode(SALT_HEX).unwrap());
        let server = ServerHandshake::start(IDENTITY, &creds.salt, &creds.verifier).unwrap();
        let client = ClientHandshake::new(IDENTITY, password);
        let a = client.public_ephemeral();
        let client_session = client
            .process_challenge(&server.salt(), &server.public_ephemeral())
            .unwrap();
        let server_session = server.verify(&a, &client_session.m1);
        (server_session, client_session)
    }

    #[test]
    fn fixed_vectors() {
        // Deterministic run with a = 0x11.. (64 bytes), b = 0x22.. (64 bytes).
        // Locked so the wire stays compatible across refactors.
        let creds = credentials_with_salt(IDENTITY, PASSWORD, &hex::decode(SALT_HEX).unwrap());
        assert_eq!(
            &creds.verifier[..64],
            "01314da198685a05480c9f0ef4275828ff102d2147efa033f757a6d790ff1ff0"
        );

        let client = ClientHandshake::with_ephemeral(IDENTITY, PASSWORD, &[0x11u8; 64]);
        assert_eq!(
            &client.public_ephemeral()[..64],
            "514fbb29d1df34464ef7629812dd94a6b984c0ac0ca238ed90d82cd93eca6a85"
        );

        // Server with the same fixed b, via a handshake whose randomness we
        // bypass by recomputing B out-of-band.
        let b = BigUint::from_bytes_be(&[0x22u8; 64]);
        let v = BigUint::from_bytes_be(&hex::decode(&creds.verifier).unwrap());
        let b_pub = (compute_k() * &v + G_2048.g.modpow(&b, &G_2048.n)) % &G_2048.n;
        assert_eq!(
            &hex::encode(pad(&b_pub))[..64],
            "7d3e09a993e9337aa0f7b4100491cd4d29cab6b7b9a1a0fe12bdfddb102eccd2"
        );

        let session = client
            .process_challenge(SALT_HEX, &hex::encode(pad(&b_pub)))
            .unwrap();
        assert_eq!(
            session.m1,
            "d0f64ff824b873e3595c9753a29e4ca52deb2273dfb2faa5d8c37f3082a5586d"
        );
        assert_eq!(
            hex::encode(session.secret),
            "a07ce4c38710eee1b66f34a7e4faa4e2f26611c7f36bee06dcd42d01341eca1c"
        );
        session
            .verify_server("2dd3e4460a1a4a278a0d3bfe5a58eb286899a6c8601dc5404c5ac095ec3e402a")
            .unwrap();
        assert_eq!(
            hex::encode(derive_session_key(&session.secret).as_bytes()),
            "346b2934559dad0db55307218850bc385986365169267f82536243ecef5058a3"
        );
    }

    #[test]
    fn full_handshake_agrees_on_key() {
        let (server_session, client_session) = run_handshake(PASSWORD);
        let server_session = server_session.unwrap();
        assert_eq!(server_session.secret, client_session.secret);
        client_session.verify_server(&server_session.m2).unwrap();
        assert_eq!(
            derive_session_key(&server_session.secret),
            derive_session_key(&client_session.secret)
        );
    }

    #[test]
    fn wrong_password_never_authenticates() {
        let (server_session, _) = run_handshake("not the password");
        assert_eq!(server_session.unwrap_err(), SrpError::ProofMismatch);
    }

    #[test]
    fn tampered_wire_values_fail() {
        let creds = credentials_with_salt(IDENTITY, PASSWORD, &hex::decode(SALT_HEX).unwrap());

        // Flip one hex char of a value and expect auth failure.
        let flip = |value: &str| -> String {
            let mut chars: Vec<char> = value.chars().collect();
            chars[0] = if chars[0] == '0' { '1' } else { '0' };
            chars.into_iter().collect()
        };

        // Tampered A
        {
            let server = ServerHandshake::start(IDENTITY, &creds.salt, &creds.verifier).unwrap();
            let client = ClientHandshake::new(IDENTITY, PASSWORD);
            let a = flip(&client.public_ephemeral());
            let session = client
                .process_challenge(&server.salt(), &server.public_ephemeral())
                .unwrap();
            assert_eq!(
                server.verify(&a, &session.m1).unwrap_err(),
                SrpError::ProofMismatch
            );
        }

        // Tampered M1
        {
            let server = ServerHandshake::start(IDENTITY, &creds.salt, &creds.verifier).unwrap();
            let client = ClientHandshake::new(IDENTITY, PASSWORD);
            let a = client.public_ephemeral();
            let session = client
                .process_challenge(&server.salt(), &server.public_ephemeral())
                .unwrap();
            assert_eq!(
                server.verify(&a, &flip(&session.m1)).unwrap_err(),
                SrpError::ProofMismatch
            );
        }

        // Tampered B: client computes a different key, server rejects M1.
        {
            let server = ServerHandshake::start(IDENTITY, &creds.salt, &creds.verifier).unwrap();
            let client = ClientHandshake::new(IDENTITY, PASSWORD);
            let a = client.public_ephemeral();
            let session = client
                .process_challenge(&server.salt(), &flip(&server.public_ephemeral()))
                .unwrap();
            assert_eq!(
                server.verify(&a, &session.m1).unwrap_err(),
                SrpError::ProofMismatch
            );
        }

        // Tampered salt
        {
            let server = ServerHandshake::start(IDENTITY, &creds.salt, &creds.verifier).unwrap();
            let client = ClientHandshake::new(IDENTITY, PASSWORD);
            let a = client.public_ephemeral();
            let session = client
                .process_challenge(&flip(&server.salt()), &server.public_ephemeral())
                .unwrap();
            assert_eq!(
                server.verify(&a, &session.m1).unwrap_err(),
                SrpError::ProofMismatch
            );
        }
    }

    #[test]
    fn zero_ephemerals_rejected() {
        let creds = credentials_with_salt(IDENTITY, PASSWORD, &hex::decode(SALT_HEX).unwrap());
        let server = ServerHandshake::start(IDENTITY, &creds.salt, &creds.verifier).unwrap();
        let zero = hex::encode(pad(&BigUint::default()));
        assert_eq!(
            server.verify(&zero, "00").unwrap_err(),
            SrpError::InvalidEphemeral
        );

        let client = ClientHandshake::new(IDENTITY, PASSWORD);
        assert_eq!(
            client.process_challenge(SALT_HEX, &zero).unwrap_err(),
            SrpError::InvalidEphemeral
        );
    }

    #[test]
    fn decoy_credentials_are_deterministic() {
        let a = decoy_credentials("ghost");
        let b = decoy_credentials("ghost");
        assert_eq!(a, b);
        assert_ne!(decoy_credentials("other").verifier, a.verifier);
        // A handshake against decoy credentials proceeds but can never verify.
        let server = ServerHandshake::start("ghost", &a.salt, &a.verifier).unwrap();
        let client = ClientHandshake::new("ghost", "any password");
        let a_pub = client.public_ephemeral();
        let session = client
            .process_challenge(&server.salt(), &server.public_ephemeral())
            .unwrap();
        assert_eq!(
            server.verify(&a_pub, &session.m1).unwrap_err(),
            SrpError::ProofMismatch
        );
    }

    #[test]
    fn salts_are_random_per_registration() {
        let a = register_credentials(IDENTITY, PASSWORD);
        let b = register_credentials(IDENTITY, PASSWORD);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.verifier, b.verifier);
        assert_eq!(a.salt.len(), SALT_LEN * 2);
    }
}
