//! TLS ClientHello / ServerHello decoder
//!
//! Parses just enough of the TLS record and handshake layers to pull out
//! SNI, negotiated/offered ALPN protocols, and cipher suites. Does not
//! attempt to decrypt anything past the handshake — PodScope only ever
//! looks at metadata.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// Decoded TLS ClientHello metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsClientHello {
    pub version: String,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub cipher_suites: Vec<String>,
}

/// Decoded TLS ServerHello metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsServerHello {
    pub version: String,
    pub alpn: Option<String>,
    pub cipher_suite: String,
}

/// GREASE values per RFC 8701: any 2-byte value of the form 0x?A?A where
/// both nibbles match. These carry no real signal so extensions of this
/// type are skipped; cipher suites of this type are kept but renamed.
fn is_grease(value: u16) -> bool {
    let hi = (value >> 8) as u8;
    let lo = value as u8;
    hi & 0x0f == 0x0a && lo & 0x0f == 0x0a && (hi >> 4) == (lo >> 4)
}

/// Map a negotiated/offered version number to its conventional name.
/// `0x0304`/`0x0303`/`0x0302`/`0x0301` are the only versions still seen on
/// the wire in practice; anything else falls back to the raw hex so the
/// value is still visible rather than silently dropped.
fn tls_version_name(version: u16) -> String {
    match version {
        0x0304 => "TLS 1.3".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0301 => "TLS 1.0".to_string(),
        0x0300 => "SSL 3.0".to_string(),
        other => format!("0x{:04x}", other),
    }
}

/// Map a cipher suite ID to its symbolic name (IANA TLS Cipher Suites
/// registry). GREASE values are renamed `"GREASE"` rather than dropped, so
/// their presence — a signal of a GREASE-aware client — still shows up on
/// the wire. Unrecognized IDs fall back to raw hex.
fn cipher_suite_name(id: u16) -> String {
    if is_grease(id) {
        return "GREASE".to_string();
    }
    match id {
        0x1301 => "TLS_AES_128_GCM_SHA256",
        0x1302 => "TLS_AES_256_GCM_SHA384",
        0x1303 => "TLS_CHACHA20_POLY1305_SHA256",
        0x1304 => "TLS_AES_128_CCM_SHA256",
        0x1305 => "TLS_AES_128_CCM_8_SHA256",
        0xc02b => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        0xc02c => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        0xc02f => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        0xc030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        0xcca8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        0xcca9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        0xc013 => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
        0xc014 => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
        0x009c => "TLS_RSA_WITH_AES_128_GCM_SHA256",
        0x009d => "TLS_RSA_WITH_AES_256_GCM_SHA384",
        0x002f => "TLS_RSA_WITH_AES_128_CBC_SHA",
        0x0035 => "TLS_RSA_WITH_AES_256_CBC_SHA",
        0x000a => "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
        0x00ff => "TLS_EMPTY_RENEGOTIATION_INFO_SCSV",
        _ => return format!("0x{:04x}", id),
    }
    .to_string()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("truncated TLS data");
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

/// Decode a TLS ClientHello out of the first TLS record in `data`. Returns
/// `None` rather than an error for anything that doesn't look like a TLS
/// handshake, since the caller doesn't know in advance whether a flow
/// carries TLS at all.
pub fn decode_tls_client_hello(data: &[u8], max_bytes: usize) -> Option<TlsClientHello> {
    decode_hello(data, max_bytes, HANDSHAKE_CLIENT_HELLO)
        .ok()
        .flatten()
        .and_then(|h| h.client)
}

/// Decode a TLS ServerHello out of the first TLS record in `data`.
pub fn decode_tls_server_hello(data: &[u8], max_bytes: usize) -> Option<TlsServerHello> {
    decode_hello(data, max_bytes, HANDSHAKE_SERVER_HELLO)
        .ok()
        .flatten()
        .and_then(|h| h.server)
}

struct Hello {
    client: Option<TlsClientHello>,
    server: Option<TlsServerHello>,
}

fn decode_hello(data: &[u8], max_bytes: usize, want: u8) -> Result<Option<Hello>> {
    let window = &data[..data.len().min(max_bytes)];
    let mut cur = Cursor::new(window);

    let record_type = cur.u8()?;
    if record_type != RECORD_HANDSHAKE {
        bail!("not a TLS handshake record");
    }
    let _legacy_version = cur.u16()?;
    let record_len = cur.u16()? as usize;
    let body = cur.take(record_len.min(cur.remaining()))?;

    let mut hs = Cursor::new(body);
    let handshake_type = hs.u8()?;
    let _len = hs.u24()?;

    if handshake_type != want {
        return Ok(None);
    }

    let client_version = hs.u16()?;
    let _random = hs.take(32)?;

    if want == HANDSHAKE_CLIENT_HELLO {
        let session_id_len = hs.u8()? as usize;
        hs.take(session_id_len)?;

        let cipher_suites_len = hs.u16()? as usize;
        let cipher_bytes = hs.take(cipher_suites_len)?;
        let cipher_suites: Vec<String> = cipher_bytes
            .chunks_exact(2)
            .map(|c| cipher_suite_name(u16::from_be_bytes([c[0], c[1]])))
            .collect();

        let compression_len = hs.u8()? as usize;
        hs.take(compression_len)?;

        let (sni, alpn) = parse_extensions(&mut hs)?;

        Ok(Some(Hello {
            client: Some(TlsClientHello {
                version: tls_version_name(client_version),
                sni,
                alpn,
                cipher_suites,
            }),
            server: None,
        }))
    } else {
        let session_id_len = hs.u8()? as usize;
        hs.take(session_id_len)?;

        let cipher_suite = hs.u16()?;
        let _compression_method = hs.u8()?;

        let (_sni, alpn) = parse_extensions(&mut hs)?;

        Ok(Some(Hello {
            client: None,
            server: Some(TlsServerHello {
                version: tls_version_name(client_version),
                alpn: alpn.into_iter().next(),
                cipher_suite: cipher_suite_name(cipher_suite),
            }),
        }))
    }
}

fn parse_extensions(cur: &mut Cursor) -> Result<(Option<String>, Vec<String>)> {
    if cur.remaining() < 2 {
        return Ok((None, Vec::new()));
    }

    let ext_block_len = cur.u16()? as usize;
    let ext_block = cur.take(ext_block_len.min(cur.remaining()))?;
    let mut ext_cur = Cursor::new(ext_block);

    let mut sni = None;
    let mut alpn = Vec::new();

    while ext_cur.remaining() >= 4 {
        let ext_type = ext_cur.u16()?;
        let ext_len = ext_cur.u16()? as usize;
        let ext_data = match ext_cur.take(ext_len.min(ext_cur.remaining())) {
            Ok(d) => d,
            Err(_) => break,
        };

        if is_grease(ext_type) {
            continue;
        }

        match ext_type {
            EXT_SERVER_NAME => {
                sni = parse_sni(ext_data);
            }
            EXT_ALPN => {
                alpn = parse_alpn(ext_data);
            }
            _ => {}
        }
    }

    Ok((sni, alpn))
}

fn parse_sni(data: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(data);
    let _list_len = cur.u16().ok()?;
    let name_type = cur.u8().ok()?;
    if name_type != 0 {
        return None;
    }
    let name_len = cur.u16().ok()? as usize;
    let name_bytes = cur.take(name_len).ok()?;
    String::from_utf8(name_bytes.to_vec()).ok()
}

fn parse_alpn(data: &[u8]) -> Vec<String> {
    let mut cur = Cursor::new(data);
    let mut protocols = Vec::new();

    let list_len = match cur.u16() {
        Ok(l) => l as usize,
        Err(_) => return protocols,
    };
    let mut remaining = list_len.min(cur.remaining());

    while remaining > 0 {
        let proto_len = match cur.u8() {
            Ok(l) => l as usize,
            Err(_) => break,
        };
        let proto_bytes = match cur.take(proto_len) {
            Ok(b) => b,
            Err(_) => break,
        };
        if let Ok(proto) = String::from_utf8(proto_bytes.to_vec()) {
            protocols.push(proto);
        }
        remaining = remaining.saturating_sub(1 + proto_len);
    }

    protocols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(sni: &str, alpn: &[&str], cipher_suites: &[u16]) -> Vec<u8> {
        let mut hs_body = Vec::new();
        hs_body.extend_from_slice(&0x0303u16.to_be_bytes());
        hs_body.extend_from_slice(&[0u8; 32]);
        hs_body.push(0);

        let cs_bytes: Vec<u8> = cipher_suites.iter().flat_map(|c| c.to_be_bytes()).collect();
        hs_body.extend_from_slice(&(cs_bytes.len() as u16).to_be_bytes());
        hs_body.extend_from_slice(&cs_bytes);

        hs_body.push(1);
        hs_body.push(0);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((sni.len() + 3) as u16).to_be_bytes());
        sni_ext.push(0);
        sni_ext.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(sni.as_bytes());

        let mut alpn_proto_bytes = Vec::new();
        for p in alpn {
            alpn_proto_bytes.push(p.len() as u8);
            alpn_proto_bytes.extend_from_slice(p.as_bytes());
        }
        let mut alpn_ext = Vec::new();
        alpn_ext.extend_from_slice(&((alpn_proto_bytes.len() + 2) as u16).to_be_bytes());
        alpn_ext.extend_from_slice(&(alpn_proto_bytes.len() as u16).to_be_bytes());
        alpn_ext.extend_from_slice(&alpn_proto_bytes);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);
        extensions.extend_from_slice(&EXT_ALPN.to_be_bytes());
        extensions.extend_from_slice(&(alpn_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&alpn_ext);

        hs_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hs_body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        let len = hs_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&hs_body);

        let mut record = Vec::new();
        record.push(RECORD_HANDSHAKE);
        record.extend_from_slice(&0x0301u16.to_be_bytes());
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        record
    }

    #[test]
    fn test_decode_client_hello_sni_and_alpn() {
        let record = build_client_hello("example.internal", &["h2", "http/1.1"], &[0x1301, 0x1302]);
        let hello = decode_tls_client_hello(&record, 4096).expect("should decode");
        assert_eq!(hello.sni.as_deref(), Some("example.internal"));
        assert_eq!(hello.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(
            hello.cipher_suites,
            vec!["TLS_AES_128_GCM_SHA256", "TLS_AES_256_GCM_SHA384"]
        );
        assert_eq!(hello.version, "TLS 1.2");
    }

    #[test]
    fn test_grease_cipher_suites_retained_and_renamed() {
        let record = build_client_hello("x", &[], &[0x0a0a, 0x1301, 0xdada]);
        let hello = decode_tls_client_hello(&record, 4096).expect("should decode");
        assert_eq!(hello.cipher_suites, vec!["GREASE", "TLS_AES_128_GCM_SHA256", "GREASE"]);
    }

    #[test]
    fn test_unknown_cipher_suite_falls_back_to_hex() {
        let record = build_client_hello("x", &[], &[0xfafa]);
        let hello = decode_tls_client_hello(&record, 4096).expect("should decode");
        assert_eq!(hello.cipher_suites, vec!["0xfafa"]);
    }

    #[test]
    fn test_non_tls_data_rejected() {
        let data = vec![0x00, 0x01, 0x02, 0x03];
        assert!(decode_tls_client_hello(&data, 4096).is_none());
    }

    #[test]
    fn test_is_grease() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xdada));
        assert!(!is_grease(0x1301));
    }

    #[test]
    fn test_tls_version_name_mapping() {
        assert_eq!(tls_version_name(0x0304), "TLS 1.3");
        assert_eq!(tls_version_name(0x0303), "TLS 1.2");
        assert_eq!(tls_version_name(0x9999), "0x9999");
    }
}
