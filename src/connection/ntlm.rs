//! NTLM message construction for the WinRM transport.
//!
//! Implements the client side of the NTLMv2 challenge-response handshake:
//! the Type 1 (Negotiate) message, parsing the server challenge out of the
//! Type 2 message, and the Type 3 (Authenticate) message carrying the NTLMv2
//! and LMv2 responses.

use rand::Rng;

use super::{SessionError, SessionResult};

// Negotiate flags sent in Type 1/Type 3 messages.
const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;

/// Difference between the Windows FILETIME epoch (1601) and the Unix epoch.
const FILETIME_EPOCH_DIFF_SECS: u64 = 11_644_473_600;
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Credentials for one NTLM handshake.
#[derive(Debug, Clone)]
pub struct NtlmCredentials {
    username: String,
    password: String,
    domain: String,
    workstation: String,
}

impl NtlmCredentials {
    /// Build credentials, splitting `DOMAIN\user` and `user@domain` forms
    /// when no explicit domain is given.
    pub fn new(username: &str, password: &str, domain: Option<&str>) -> Self {
        let (parsed_domain, user) = match domain {
            Some(d) => (Some(d.to_string()), username.to_string()),
            None => split_domain(username),
        };
        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "WORKSTATION".to_string());

        Self {
            username: user,
            password: password.to_string(),
            domain: parsed_domain.unwrap_or_default(),
            workstation,
        }
    }

    /// Username without the domain part.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The Type 1 (Negotiate) message.
    pub fn negotiate_message(&self) -> Vec<u8> {
        let flags = NEGOTIATE_UNICODE
            | NEGOTIATE_OEM
            | REQUEST_TARGET
            | NEGOTIATE_NTLM
            | NEGOTIATE_ALWAYS_SIGN
            | NEGOTIATE_EXTENDED_SESSIONSECURITY;

        let workstation = self.workstation.as_bytes();
        let domain = self.domain.as_bytes();
        // Payload starts right after the 32-byte fixed part; workstation
        // first, then domain.
        let workstation_offset = 32u32;
        let domain_offset = workstation_offset + workstation.len() as u32;

        let mut message = b"NTLMSSP\0".to_vec();
        message.extend_from_slice(&1u32.to_le_bytes());
        message.extend_from_slice(&flags.to_le_bytes());
        push_security_buffer(&mut message, domain.len(), domain_offset);
        push_security_buffer(&mut message, workstation.len(), workstation_offset);
        message.extend_from_slice(workstation);
        message.extend_from_slice(domain);
        message
    }

    /// The Type 3 (Authenticate) message for a server challenge.
    pub fn authenticate_message(&self, challenge: &[u8]) -> SessionResult<Vec<u8>> {
        if challenge.len() < 32 {
            return Err(SessionError::Authentication {
                user: self.username.clone(),
                host: String::new(),
                message: "NTLM challenge message too short".to_string(),
            });
        }
        // Server challenge lives at bytes 24..32 of the Type 2 message.
        let server_challenge = &challenge[24..32];
        let client_challenge: [u8; 8] = rand::thread_rng().gen();

        let nt_response = self.ntlmv2_response(server_challenge, &client_challenge);
        let lm_response = self.lmv2_response(server_challenge, &client_challenge);

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        // Fixed header is 88 bytes; payloads follow in this order.
        let base_offset = 88u32;
        let lm_offset = base_offset;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let user_offset = domain_offset + domain.len() as u32;
        let workstation_offset = user_offset + user.len() as u32;
        let session_key_offset = workstation_offset + workstation.len() as u32;

        let mut message = b"NTLMSSP\0".to_vec();
        message.extend_from_slice(&3u32.to_le_bytes());
        push_security_buffer(&mut message, lm_response.len(), lm_offset);
        push_security_buffer(&mut message, nt_response.len(), nt_offset);
        push_security_buffer(&mut message, domain.len(), domain_offset);
        push_security_buffer(&mut message, user.len(), user_offset);
        push_security_buffer(&mut message, workstation.len(), workstation_offset);
        // Encrypted random session key: empty.
        push_security_buffer(&mut message, 0, session_key_offset);

        let flags =
            NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_ALWAYS_SIGN | NEGOTIATE_EXTENDED_SESSIONSECURITY;
        message.extend_from_slice(&flags.to_le_bytes());
        // Version (8 bytes) and MIC (16 bytes), both zeroed.
        message.extend_from_slice(&[0u8; 8]);
        message.extend_from_slice(&[0u8; 16]);

        message.extend_from_slice(&lm_response);
        message.extend_from_slice(&nt_response);
        message.extend_from_slice(&domain);
        message.extend_from_slice(&user);
        message.extend_from_slice(&workstation);
        Ok(message)
    }

    /// NTLMv2 hash: HMAC-MD5(MD4(password), UPPER(user) + domain).
    fn ntlmv2_hash(&self) -> [u8; 16] {
        let nt_hash = md4_hash(&utf16le(&self.password));
        let identity = format!(
            "{}{}",
            self.username.to_uppercase(),
            self.domain.to_uppercase()
        );
        hmac_md5(&nt_hash, &utf16le(&identity))
    }

    fn ntlmv2_response(&self, server_challenge: &[u8], client_challenge: &[u8]) -> Vec<u8> {
        let hash = self.ntlmv2_hash();

        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes()); // blob signature
        blob.extend_from_slice(&1u32.to_le_bytes()); // reserved
        blob.extend_from_slice(&filetime_now().to_le_bytes());
        blob.extend_from_slice(client_challenge);
        blob.extend_from_slice(&0u32.to_le_bytes());

        let mut data = server_challenge.to_vec();
        data.extend_from_slice(&blob);
        let proof = hmac_md5(&hash, &data);

        let mut response = proof.to_vec();
        response.extend_from_slice(&blob);
        response
    }

    fn lmv2_response(&self, server_challenge: &[u8], client_challenge: &[u8]) -> Vec<u8> {
        let hash = self.ntlmv2_hash();
        let mut data = server_challenge.to_vec();
        data.extend_from_slice(client_challenge);
        let proof = hmac_md5(&hash, &data);

        let mut response = proof.to_vec();
        response.extend_from_slice(client_challenge);
        response
    }
}

/// Split `DOMAIN\user` or `user@domain` into (domain, user).
fn split_domain(username: &str) -> (Option<String>, String) {
    if let Some((domain, user)) = username.split_once('\\') {
        (Some(domain.to_string()), user.to_string())
    } else if let Some((user, domain)) = username.split_once('@') {
        (Some(domain.to_string()), user.to_string())
    } else {
        (None, username.to_string())
    }
}

/// Append an NTLM security buffer: length, max length, offset.
fn push_security_buffer(message: &mut Vec<u8>, len: usize, offset: u32) {
    let len = len as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&offset.to_le_bytes());
}

/// UTF-16LE bytes of a string.
fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn md4_hash(data: &[u8]) -> [u8; 16] {
    use md4::{Digest, Md4};
    let mut hasher = Md4::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut key_block = [0u8; 64];
    if key.len() > 64 {
        key_block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = vec![0u8; 64];
    let mut outer = vec![0u8; 64];
    for (i, b) in key_block.iter().enumerate() {
        inner[i] = b ^ 0x36;
        outer[i] = b ^ 0x5c;
    }

    inner.extend_from_slice(data);
    let inner_hash = md5::compute(&inner);
    outer.extend_from_slice(&inner_hash.0);
    md5::compute(&outer).0
}

/// Current time as a Windows FILETIME value.
fn filetime_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (now + FILETIME_EPOCH_DIFF_SECS) * FILETIME_TICKS_PER_SECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_backslash_and_upn_forms() {
        let creds = NtlmCredentials::new("CORP\\svc-deploy", "pw", None);
        assert_eq!(creds.username(), "svc-deploy");
        assert_eq!(creds.domain, "CORP");

        let creds = NtlmCredentials::new("svc-deploy@corp.local", "pw", None);
        assert_eq!(creds.username(), "svc-deploy");
        assert_eq!(creds.domain, "corp.local");

        let creds = NtlmCredentials::new("svc-deploy", "pw", Some("CORP"));
        assert_eq!(creds.domain, "CORP");
    }

    #[test]
    fn negotiate_message_has_signature_and_type() {
        let creds = NtlmCredentials::new("user", "pass", Some("DOMAIN"));
        let msg = creds.negotiate_message();
        assert_eq!(&msg[0..8], b"NTLMSSP\0");
        assert_eq!(&msg[8..12], &1u32.to_le_bytes());
        // Fixed part plus workstation plus domain.
        assert_eq!(msg.len(), 32 + creds.workstation.len() + "DOMAIN".len());
    }

    #[test]
    fn authenticate_message_rejects_short_challenge() {
        let creds = NtlmCredentials::new("user", "pass", Some("DOMAIN"));
        assert!(creds.authenticate_message(&[0u8; 8]).is_err());
    }

    #[test]
    fn authenticate_message_layout() {
        let creds = NtlmCredentials::new("user", "pass", Some("DOMAIN"));
        let mut challenge = vec![0u8; 40];
        challenge[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let msg = creds.authenticate_message(&challenge).unwrap();
        assert_eq!(&msg[0..8], b"NTLMSSP\0");
        assert_eq!(&msg[8..12], &3u32.to_le_bytes());

        // The LM response buffer points just past the fixed header.
        let lm_len = u16::from_le_bytes([msg[12], msg[13]]) as usize;
        let lm_offset = u32::from_le_bytes([msg[16], msg[17], msg[18], msg[19]]) as usize;
        assert_eq!(lm_offset, 88);
        // LMv2 response is a 16-byte proof plus the 8-byte client challenge.
        assert_eq!(lm_len, 24);
        assert!(msg.len() >= lm_offset + lm_len);
    }

    #[test]
    fn hmac_md5_matches_rfc2104_test_vector() {
        // RFC 2104 test case: key = 16 x 0x0b, data = "Hi There".
        let key = [0x0bu8; 16];
        let mac = hmac_md5(&key, b"Hi There");
        assert_eq!(
            mac,
            [
                0x92, 0x94, 0x72, 0x7a, 0x36, 0x38, 0xbb, 0x1c, 0x13, 0xf4, 0x8e, 0xf8, 0x15,
                0x8b, 0xfc, 0x9d
            ]
        );
    }
}
