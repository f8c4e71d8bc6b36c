//! CDoc2 header schema: one `Header` table holding `RecipientRecord`s,
//! each with a `Capsule` union describing the key-agreement path.
//!
//! Field ids and enum values follow the published schema; they are wire
//! contract and must not change.

use log::warn;

use crate::cdoc2::fbs::{Builder, Field, Table};
use crate::error::{Error, Result};
use crate::lock::{Lock, LockKind};

// Capsule union tags.
const CAPSULE_ECC: u8 = 1;
const CAPSULE_RSA: u8 = 2;
const CAPSULE_KEYSERVER: u8 = 3;
const CAPSULE_SYMMETRIC: u8 = 4;
const CAPSULE_PBKDF2: u8 = 5;

// KeyDetailsUnion tags inside KeyServerCapsule.
const DETAILS_ECC: u8 = 1;
const DETAILS_RSA: u8 = 2;

const FMK_METHOD_XOR: u8 = 1;
const PAYLOAD_CHACHA20POLY1305: u8 = 1;
const CURVE_SECP384R1: u8 = 1;
const KDF_PBKDF2_HMAC_SHA256: u8 = 1;

// RecipientRecord fields.
const REC_CAPSULE_TYPE: u16 = 0;
const REC_CAPSULE: u16 = 1;
const REC_KEY_LABEL: u16 = 2;
const REC_ENCRYPTED_FMK: u16 = 3;
const REC_FMK_METHOD: u16 = 4;

// Header fields.
const HDR_RECIPIENTS: u16 = 0;
const HDR_PAYLOAD_METHOD: u16 = 1;

/// Serialize the header for a finished recipient list.
pub fn serialize(locks: &[Lock]) -> Result<Vec<u8>> {
    let mut b = Builder::with_capacity(1024);
    let mut records = Vec::with_capacity(locks.len());
    for lock in locks {
        let (capsule_type, capsule) = match &lock.kind {
            LockKind::PublicKeyEcc { rcpt_key, sender_key } => {
                let rk = b.create_bytes(rcpt_key);
                let sk = b.create_bytes(sender_key);
                let t = b.create_table(&[
                    (0, Field::U8(CURVE_SECP384R1)),
                    (1, Field::Ref(rk)),
                    (2, Field::Ref(sk)),
                ]);
                (CAPSULE_ECC, t)
            }
            LockKind::PublicKeyRsa { rcpt_key, encrypted_kek } => {
                let rk = b.create_bytes(rcpt_key);
                let ek = b.create_bytes(encrypted_kek);
                let t = b.create_table(&[(0, Field::Ref(rk)), (1, Field::Ref(ek))]);
                (CAPSULE_RSA, t)
            }
            LockKind::Server { rcpt_key, rsa, keyserver_id, transaction_id } => {
                let rk = b.create_bytes(rcpt_key);
                let (dt, details) = if *rsa {
                    (DETAILS_RSA, b.create_table(&[(0, Field::Ref(rk))]))
                } else {
                    (
                        DETAILS_ECC,
                        b.create_table(&[
                            (0, Field::U8(CURVE_SECP384R1)),
                            (1, Field::Ref(rk)),
                        ]),
                    )
                };
                let ks = b.create_string(keyserver_id);
                let tx = b.create_string(transaction_id);
                let t = b.create_table(&[
                    (0, Field::U8(dt)),
                    (1, Field::Ref(details)),
                    (2, Field::Ref(ks)),
                    (3, Field::Ref(tx)),
                ]);
                (CAPSULE_KEYSERVER, t)
            }
            LockKind::Symmetric { salt } => {
                let s = b.create_bytes(salt);
                (CAPSULE_SYMMETRIC, b.create_table(&[(0, Field::Ref(s))]))
            }
            LockKind::Password { salt, pw_salt, kdf_iter } => {
                let s = b.create_bytes(salt);
                let ps = b.create_bytes(pw_salt);
                let t = b.create_table(&[
                    (0, Field::Ref(s)),
                    (1, Field::Ref(ps)),
                    (2, Field::U8(KDF_PBKDF2_HMAC_SHA256)),
                    (3, Field::I32(*kdf_iter as i32)),
                ]);
                (CAPSULE_PBKDF2, t)
            }
            LockKind::Cdoc1Rsa { .. } | LockKind::Cdoc1Ecc { .. } => {
                return Err(Error::invalid("CDoc1 lock in a CDoc2 header"));
            }
        };
        let label = b.create_string(&lock.label);
        let fmk = b.create_bytes(&lock.encrypted_fmk);
        records.push(b.create_table(&[
            (REC_CAPSULE_TYPE, Field::U8(capsule_type)),
            (REC_CAPSULE, Field::Ref(capsule)),
            (REC_KEY_LABEL, Field::Ref(label)),
            (REC_ENCRYPTED_FMK, Field::Ref(fmk)),
            (REC_FMK_METHOD, Field::U8(FMK_METHOD_XOR)),
        ]));
    }
    let recipients = b.create_ref_vector(&records);
    let header = b.create_table(&[
        (HDR_RECIPIENTS, Field::Ref(recipients)),
        (HDR_PAYLOAD_METHOD, Field::U8(PAYLOAD_CHACHA20POLY1305)),
    ]);
    Ok(b.finish(header))
}

fn required_bytes(t: &Table<'_>, id: u16, what: &str) -> Result<Vec<u8>> {
    t.bytes_field(id)?
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::format(format!("recipient missing {what}")))
}

fn required_str(t: &Table<'_>, id: u16, what: &str) -> Result<String> {
    t.str_field(id)?
        .map(str::to_owned)
        .ok_or_else(|| Error::format(format!("recipient missing {what}")))
}

/// Parse and verify a header buffer into its lock list.
///
/// Recipients with an unknown capsule kind, curve or KDF are skipped with a
/// warning so the remaining locks stay usable; a header where every capsule
/// is unknown still yields an empty lock set.
pub fn parse(buf: &[u8]) -> Result<Vec<Lock>> {
    let header = Table::root(buf)?;
    if header.u8_field(HDR_PAYLOAD_METHOD, 0)? != PAYLOAD_CHACHA20POLY1305 {
        return Err(Error::NotSupported(
            "unsupported payload encryption method".into(),
        ));
    }
    let mut locks = Vec::new();
    let recipients = match header.vector_field(HDR_RECIPIENTS)? {
        Some(v) => v,
        None => return Ok(locks),
    };
    for i in 0..recipients.len() {
        let rec = recipients.get(i)?;
        if rec.u8_field(REC_FMK_METHOD, 0)? != FMK_METHOD_XOR {
            warn!("recipient {i}: unsupported FMK encryption method, skipping");
            continue;
        }
        let capsule_type = rec.u8_field(REC_CAPSULE_TYPE, 0)?;
        let capsule = rec
            .table_field(REC_CAPSULE)?
            .ok_or_else(|| Error::format("recipient missing capsule"))?;

        let kind = match capsule_type {
            CAPSULE_ECC => {
                if capsule.u8_field(0, 0)? != CURVE_SECP384R1 {
                    warn!("recipient {i}: unsupported elliptic curve, skipping");
                    continue;
                }
                LockKind::PublicKeyEcc {
                    rcpt_key: required_bytes(&capsule, 1, "recipient public key")?,
                    sender_key: required_bytes(&capsule, 2, "sender public key")?,
                }
            }
            CAPSULE_RSA => LockKind::PublicKeyRsa {
                rcpt_key: required_bytes(&capsule, 0, "recipient public key")?,
                encrypted_kek: required_bytes(&capsule, 1, "encrypted KEK")?,
            },
            CAPSULE_KEYSERVER => {
                let details_type = capsule.u8_field(0, 0)?;
                let details = capsule
                    .table_field(1)?
                    .ok_or_else(|| Error::format("key server capsule missing details"))?;
                let (rcpt_key, rsa) = match details_type {
                    DETAILS_ECC => {
                        if details.u8_field(0, 0)? != CURVE_SECP384R1 {
                            warn!("recipient {i}: unsupported elliptic curve, skipping");
                            continue;
                        }
                        (required_bytes(&details, 1, "recipient public key")?, false)
                    }
                    DETAILS_RSA => {
                        (required_bytes(&details, 0, "recipient public key")?, true)
                    }
                    _ => {
                        warn!("recipient {i}: unsupported key server details, skipping");
                        continue;
                    }
                };
                LockKind::Server {
                    rcpt_key,
                    rsa,
                    keyserver_id: required_str(&capsule, 2, "key server id")?,
                    transaction_id: required_str(&capsule, 3, "transaction id")?,
                }
            }
            CAPSULE_SYMMETRIC => LockKind::Symmetric {
                salt: required_bytes(&capsule, 0, "salt")?,
            },
            CAPSULE_PBKDF2 => {
                if capsule.u8_field(2, 0)? != KDF_PBKDF2_HMAC_SHA256 {
                    warn!("recipient {i}: unsupported KDF algorithm, skipping");
                    continue;
                }
                let kdf_iter = capsule.i32_field(3, 0)?;
                if kdf_iter <= 0 {
                    return Err(Error::format("non-positive PBKDF2 iteration count"));
                }
                LockKind::Password {
                    salt: required_bytes(&capsule, 0, "salt")?,
                    pw_salt: required_bytes(&capsule, 1, "password salt")?,
                    kdf_iter: kdf_iter as u32,
                }
            }
            other => {
                warn!("recipient {i}: unknown capsule kind {other}, skipping");
                continue;
            }
        };

        locks.push(Lock {
            label: required_str(&rec, REC_KEY_LABEL, "key label")?,
            encrypted_fmk: required_bytes(&rec, REC_ENCRYPTED_FMK, "encrypted FMK")?,
            kind,
        });
    }
    Ok(locks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_locks() -> Vec<Lock> {
        vec![
            Lock {
                label: "ecc".into(),
                encrypted_fmk: vec![1; 32],
                kind: LockKind::PublicKeyEcc {
                    rcpt_key: vec![4; 97],
                    sender_key: vec![5; 97],
                },
            },
            Lock {
                label: "rsa".into(),
                encrypted_fmk: vec![2; 32],
                kind: LockKind::PublicKeyRsa {
                    rcpt_key: vec![6; 270],
                    encrypted_kek: vec![7; 256],
                },
            },
            Lock {
                label: "server".into(),
                encrypted_fmk: vec![3; 32],
                kind: LockKind::Server {
                    rcpt_key: vec![8; 97],
                    rsa: false,
                    keyserver_id: "00000000-0000-0000-0000-000000000000".into(),
                    transaction_id: "KSC-1".into(),
                },
            },
            Lock {
                label: "sym".into(),
                encrypted_fmk: vec![9; 32],
                kind: LockKind::Symmetric { salt: vec![10; 32] },
            },
            Lock {
                label: "pw".into(),
                encrypted_fmk: vec![11; 32],
                kind: LockKind::Password {
                    salt: vec![12; 32],
                    pw_salt: vec![13; 32],
                    kdf_iter: 100_000,
                },
            },
        ]
    }

    #[test]
    fn header_round_trip() {
        let locks = sample_locks();
        let buf = serialize(&locks).unwrap();
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.len(), locks.len());
        for (a, b) in parsed.iter().zip(locks.iter()) {
            assert_eq!(a.label, b.label);
            assert_eq!(a.encrypted_fmk, b.encrypted_fmk);
        }
        match (&parsed[0].kind, &locks[0].kind) {
            (
                LockKind::PublicKeyEcc { rcpt_key: a1, sender_key: a2 },
                LockKind::PublicKeyEcc { rcpt_key: b1, sender_key: b2 },
            ) => {
                assert_eq!(a1, b1);
                assert_eq!(a2, b2);
            }
            _ => panic!("lock kind lost in round trip"),
        }
        match &parsed[4].kind {
            LockKind::Password { kdf_iter, .. } => assert_eq!(*kdf_iter, 100_000),
            _ => panic!("password lock lost in round trip"),
        }
    }

    #[test]
    fn unknown_capsule_is_skipped_not_fatal() {
        use crate::cdoc2::fbs::{Builder, Field};
        let mut b = Builder::with_capacity(256);
        // A recipient with an unrecognized capsule tag...
        let mystery = b.create_table(&[(0, Field::U8(77))]);
        let label1 = b.create_string("future");
        let fmk1 = b.create_bytes(&[0u8; 32]);
        let rec1 = b.create_table(&[
            (REC_CAPSULE_TYPE, Field::U8(42)),
            (REC_CAPSULE, Field::Ref(mystery)),
            (REC_KEY_LABEL, Field::Ref(label1)),
            (REC_ENCRYPTED_FMK, Field::Ref(fmk1)),
            (REC_FMK_METHOD, Field::U8(FMK_METHOD_XOR)),
        ]);
        // ...followed by a valid symmetric one.
        let salt = b.create_bytes(&[1u8; 32]);
        let caps = b.create_table(&[(0, Field::Ref(salt))]);
        let label2 = b.create_string("good");
        let fmk2 = b.create_bytes(&[2u8; 32]);
        let rec2 = b.create_table(&[
            (REC_CAPSULE_TYPE, Field::U8(CAPSULE_SYMMETRIC)),
            (REC_CAPSULE, Field::Ref(caps)),
            (REC_KEY_LABEL, Field::Ref(label2)),
            (REC_ENCRYPTED_FMK, Field::Ref(fmk2)),
            (REC_FMK_METHOD, Field::U8(FMK_METHOD_XOR)),
        ]);
        let v = b.create_ref_vector(&[rec1, rec2]);
        let hdr = b.create_table(&[
            (HDR_RECIPIENTS, Field::Ref(v)),
            (HDR_PAYLOAD_METHOD, Field::U8(PAYLOAD_CHACHA20POLY1305)),
        ]);
        let buf = b.finish(hdr);

        let locks = parse(&buf).unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].label, "good");
    }

    #[test]
    fn wrong_payload_method_is_rejected() {
        let mut b = Builder::with_capacity(64);
        let hdr = b.create_table(&[(HDR_PAYLOAD_METHOD, Field::U8(0))]);
        let buf = b.finish(hdr);
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn garbage_header_fails_verification() {
        assert!(parse(&[0xff; 64]).is_err());
        assert!(parse(&[]).is_err());
    }
}
