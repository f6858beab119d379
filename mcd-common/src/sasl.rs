//! # SASL Mechanisms
//!
//! Client side of the challenge/response exchange. Mechanisms are looked up
//! by name, case-insensitively.

/// A client mechanism producing the messages sent to the server.
pub trait SaslMechanism: Send {
    /// Name as announced by the server.
    fn name(&self) -> &'static str;

    /// Initial response sent with the auth request.
    fn start(&mut self, username: &str, password: &str) -> Vec<u8>;

    /// Answer to a server challenge. `None` ends the exchange.
    fn step(&mut self, challenge: &[u8]) -> Option<Vec<u8>>;
}

/// PLAIN (RFC 4616): `NUL user NUL password`, single step.
#[derive(Debug, Default)]
pub struct Plain;

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn start(&mut self, username: &str, password: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(username.len() + password.len() + 2);
        out.push(0);
        out.extend_from_slice(username.as_bytes());
        out.push(0);
        out.extend_from_slice(password.as_bytes());
        out
    }

    fn step(&mut self, _challenge: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Looks up a mechanism by name.
pub fn mechanism(name: &str) -> Option<Box<dyn SaslMechanism>> {
    if name.eq_ignore_ascii_case("PLAIN") {
        Some(Box::new(Plain))
    } else {
        None
    }
}

/// Splits a space-separated mechanism list.
pub fn parse_mechanisms(list: &str) -> Vec<String> {
    list.split_whitespace().map(str::to_string).collect()
}

/// Decodes a PLAIN initial response into (authzid, user, password).
pub fn decode_plain(data: &[u8]) -> Option<(&str, &str, &str)> {
    let mut parts = data.splitn(3, |b| *b == 0);
    let authz = std::str::from_utf8(parts.next()?).ok()?;
    let user = std::str::from_utf8(parts.next()?).ok()?;
    let password = std::str::from_utf8(parts.next()?).ok()?;
    Some((authz, user, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response() {
        let mut mech = mechanism("plain").unwrap();
        assert_eq!(mech.name(), "PLAIN");
        assert_eq!(mech.start("bucket-1", "pw"), b"\0bucket-1\0pw");
        assert!(mech.step(b"anything").is_none());
    }

    #[test]
    fn unknown_mechanism() {
        assert!(mechanism("SCRAM-SHA1").is_none());
        assert!(mechanism("").is_none());
    }

    #[test]
    fn mechanism_list() {
        assert_eq!(parse_mechanisms("PLAIN  CRAM-MD5 "), vec!["PLAIN", "CRAM-MD5"]);
        assert!(parse_mechanisms("").is_empty());
    }

    #[test]
    fn plain_decodes_symmetric() {
        let data = Plain.start("bucket-1", "1S|=,%#x1");
        assert_eq!(decode_plain(&data), Some(("", "bucket-1", "1S|=,%#x1")));
        assert_eq!(decode_plain(b"no-separators"), None);
    }
}
