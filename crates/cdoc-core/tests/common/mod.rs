//! Test fixtures: throwaway self-"signed" certificates, just well-formed
//! enough for the container code, which reads public keys but never
//! validates signatures.

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len < 0x100 {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, len as u8]
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&der_len(content.len()));
    out.extend_from_slice(content);
    out
}

fn seq(parts: &[&[u8]]) -> Vec<u8> {
    let mut content = Vec::new();
    for p in parts {
        content.extend_from_slice(p);
    }
    tlv(0x30, &content)
}

const OID_SHA256_RSA: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b,
];
const OID_ECDSA_SHA384: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x03];
const OID_EC_PUBKEY: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_SECP384R1: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
const DER_NULL: &[u8] = &[0x05, 0x00];

/// SubjectPublicKeyInfo for a P-384 point (SEC1 encoding).
pub fn ec_spki(point: &[u8]) -> Vec<u8> {
    let alg = seq(&[OID_EC_PUBKEY, OID_SECP384R1]);
    let mut bits = vec![0u8];
    bits.extend_from_slice(point);
    let key = tlv(0x03, &bits);
    seq(&[&alg, &key])
}

/// A structurally valid certificate around the given SPKI. The signature
/// bytes are filler.
pub fn make_cert(spki_der: &[u8], ec: bool) -> Vec<u8> {
    let version = tlv(0xa0, &tlv(0x02, &[2]));
    let serial = tlv(0x02, &[1]);
    let sig_alg = if ec {
        seq(&[OID_ECDSA_SHA384])
    } else {
        seq(&[OID_SHA256_RSA, DER_NULL])
    };
    let empty_name = tlv(0x30, &[]);
    let validity = seq(&[
        &tlv(0x17, b"240101000000Z"),
        &tlv(0x17, b"400101000000Z"),
    ]);
    let tbs = seq(&[
        &version, &serial, &sig_alg, &empty_name, &validity, &empty_name, spki_der,
    ]);
    let mut sig_bits = vec![0u8];
    sig_bits.extend_from_slice(&[0xab; 20]);
    let signature = tlv(0x03, &sig_bits);
    seq(&[&tbs, &sig_alg, &signature])
}
