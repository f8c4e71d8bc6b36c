//! End-to-end scenarios for the CDoc2 codec over the public API.

use std::io::Cursor;

use cdoc_core::{
    crypto, open_reader_source, CdocReader, CdocWriter, Cdoc2Writer, Error, ErrorCode,
    LockKind, NetworkBackend, Recipient, Result, SoftKeyBackend, VecConsumer,
};

fn encrypt_files(
    backend: &SoftKeyBackend,
    network: Option<&dyn NetworkBackend>,
    recipients: &[Recipient],
    files: &[(&str, &[u8])],
) -> Vec<u8> {
    let mut writer = Cdoc2Writer::new(Vec::new(), backend, network);
    writer.begin_encryption().unwrap();
    for r in recipients {
        writer.add_recipient(r).unwrap();
    }
    for (name, data) in files {
        writer.add_file(name, data.len() as i64).unwrap();
        // Uneven chunks exercise the streaming path.
        for chunk in data.chunks(1000) {
            writer.write_data(chunk).unwrap();
        }
    }
    writer.finish_encryption().unwrap();
    writer.take_output().unwrap()
}

fn decrypt_all(container: &[u8], backend: &SoftKeyBackend) -> Result<Vec<(String, Vec<u8>)>> {
    let mut reader = open_reader_source(Cursor::new(container.to_vec()), backend, None)?;
    let lock = reader.locks().first().cloned().ok_or(Error::UnknownFormat)?;
    let fmk = reader.get_fmk(&lock)?;
    let mut sink = VecConsumer::new();
    reader.decrypt(&fmk, &mut sink)?;
    Ok(sink.files)
}

#[test]
fn symmetric_zero_key_hello() {
    // Key of 32 zero bytes, label "t", payload "hello".
    let backend = SoftKeyBackend::new().with_secret("t", &[0u8; 32]);
    let container = encrypt_files(
        &backend,
        None,
        &[Recipient::make_symmetric("t")],
        &[("greeting.txt", b"hello")],
    );
    let files = decrypt_all(&container, &backend).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "greeting.txt");
    assert_eq!(files[0].1, b"hello");
}

#[test]
fn password_megabyte_and_wrong_password() {
    let backend = SoftKeyBackend::new().with_secret("pw", b"secret");
    let mut payload = vec![0u8; 1 << 20];
    crypto::random_bytes(&mut payload);
    let container = encrypt_files(
        &backend,
        None,
        &[Recipient::make_password("pw", 100_000)],
        &[("blob.bin", &payload)],
    );
    let files = decrypt_all(&container, &backend).unwrap();
    assert_eq!(files[0].1, payload);

    let wrong = SoftKeyBackend::new().with_secret("pw", b"Secret");
    match decrypt_all(&container, &wrong) {
        Err(e) => assert_eq!(e.code(), ErrorCode::HashMismatch),
        Ok(_) => panic!("wrong password must not decrypt"),
    }
}

#[test]
fn ecc_lock_and_wrong_private_key() {
    let (sk, pk) = crypto::generate_p384();
    let backend = SoftKeyBackend::new().with_ec_key("me", sk);
    let container = encrypt_files(
        &backend,
        None,
        &[Recipient::make_ecc_key("me", pk)],
        &[("doc.txt", b"for your eyes only")],
    );
    let files = decrypt_all(&container, &backend).unwrap();
    assert_eq!(files[0].1, b"for your eyes only");

    let (other_sk, _) = crypto::generate_p384();
    let wrong = SoftKeyBackend::new().with_ec_key("me", other_sk);
    match decrypt_all(&container, &wrong) {
        Err(e) => assert_eq!(e.code(), ErrorCode::HashMismatch),
        Ok(_) => panic!("foreign private key must not decrypt"),
    }
}

#[test]
fn rsa_lock_round_trip() {
    let (sk, spki) = crypto::generate_rsa(2048).unwrap();
    let backend = SoftKeyBackend::new().with_rsa_key("r", sk);
    let container = encrypt_files(
        &backend,
        None,
        &[Recipient::make_rsa_key("r", spki)],
        &[("doc.txt", b"rsa transported KEK")],
    );
    let files = decrypt_all(&container, &backend).unwrap();
    assert_eq!(files[0].1, b"rsa transported KEK");
}

#[test]
fn multi_recipient_agreement() {
    let (ec_sk, ec_pk) = crypto::generate_p384();
    let writer_backend = SoftKeyBackend::new()
        .with_secret("shared", &[9u8; 32])
        .with_secret("phrase", b"hunter2");
    let container = encrypt_files(
        &writer_backend,
        None,
        &[
            Recipient::make_symmetric("shared"),
            Recipient::make_password("phrase", 100_000),
            Recipient::make_ecc_key("card", ec_pk),
        ],
        &[("shared.txt", b"same plaintext for everyone")],
    );

    // Each lock alone recovers the identical payload.
    for (label, backend) in [
        ("shared", SoftKeyBackend::new().with_secret("shared", &[9u8; 32])),
        ("phrase", SoftKeyBackend::new().with_secret("phrase", b"hunter2")),
        ("card", SoftKeyBackend::new().with_ec_key("card", ec_sk.clone())),
    ] {
        let mut reader =
            open_reader_source(Cursor::new(container.clone()), &backend, None).unwrap();
        let lock = reader
            .locks()
            .iter()
            .find(|l| l.label == label)
            .cloned()
            .unwrap();
        let fmk = reader.get_fmk(&lock).unwrap();
        let mut sink = VecConsumer::new();
        reader.decrypt(&fmk, &mut sink).unwrap();
        assert_eq!(sink.files[0].1, b"same plaintext for everyone");
    }
}

#[test]
fn pull_decryption_order_and_end() {
    let backend = SoftKeyBackend::new().with_secret("t", &[1u8; 32]);
    let container = encrypt_files(
        &backend,
        None,
        &[Recipient::make_symmetric("t")],
        &[("a.txt", b"A"), ("b/c.txt", b"BC")],
    );
    let mut reader = open_reader_source(Cursor::new(container), &backend, None).unwrap();
    let lock = reader.locks()[0].clone();
    let fmk = reader.get_fmk(&lock).unwrap();
    reader.begin_decryption(&fmk).unwrap();

    let f1 = reader.next_file().unwrap().unwrap();
    assert_eq!((f1.name.as_str(), f1.size), ("a.txt", 1));
    let mut buf = [0u8; 16];
    let n = reader.read_data(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"A");

    let f2 = reader.next_file().unwrap().unwrap();
    assert_eq!((f2.name.as_str(), f2.size), ("b/c.txt", 2));
    let mut content = Vec::new();
    loop {
        let n = reader.read_data(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        content.extend_from_slice(&buf[..n]);
    }
    assert_eq!(content, b"BC");

    assert!(reader.next_file().unwrap().is_none());
    reader.finish_decryption().unwrap();
}

#[test]
fn header_tamper_yields_hash_mismatch() {
    let backend = SoftKeyBackend::new()
        .with_secret("a", &[3u8; 32])
        .with_secret("b", b"pass");
    let container = encrypt_files(
        &backend,
        None,
        &[
            Recipient::make_symmetric("a"),
            Recipient::make_password("b", 100_000),
        ],
        &[("x", b"payload")],
    );
    let header_len =
        u32::from_be_bytes([container[6], container[7], container[8], container[9]]) as usize;

    // Flip one bit at a spread of header positions: the header either no
    // longer parses or every surviving lock errors out, and structurally
    // intact flips must surface as a hash mismatch. Success is never
    // acceptable.
    let mut saw_mismatch = false;
    for pos in [10, 10 + header_len / 3, 10 + header_len / 2, 10 + header_len - 1] {
        for bit in [0x01u8, 0x80u8] {
            let mut bad = container.clone();
            bad[pos] ^= bit;
            let reader = open_reader_source(Cursor::new(bad), &backend, None);
            let mut reader = match reader {
                Err(_) => continue,
                Ok(r) => r,
            };
            for lock in reader.locks().to_vec() {
                match reader.get_fmk(&lock) {
                    Err(e) => saw_mismatch |= e.code() == ErrorCode::HashMismatch,
                    Ok(_) => panic!("tampered header accepted at {pos} bit {bit:#x}"),
                }
            }
        }
    }
    assert!(saw_mismatch, "no flip exercised the header HMAC check");
}

#[test]
fn payload_and_tag_tamper_fail() {
    let backend = SoftKeyBackend::new().with_secret("t", &[4u8; 32]);
    // Incompressible payload, so ciphertext dominates the container.
    let mut payload = vec![0u8; 4096];
    crypto::random_bytes(&mut payload);
    let container = encrypt_files(
        &backend,
        None,
        &[Recipient::make_symmetric("t")],
        &[("x", &payload)],
    );

    // Ciphertext byte, well before the trailing tag.
    let mut bad = container.clone();
    let mid = container.len() - 100;
    bad[mid] ^= 0x01;
    assert!(decrypt_all(&bad, &backend).is_err());

    // Tag byte.
    let mut bad = container.clone();
    let last = container.len() - 1;
    bad[last] ^= 0x01;
    assert!(decrypt_all(&bad, &backend).is_err());
}

#[test]
fn workflow_order_is_enforced() {
    let backend = SoftKeyBackend::new().with_secret("t", &[5u8; 32]);

    let mut writer = Cdoc2Writer::new(Vec::new(), &backend, None);
    assert_eq!(
        writer.add_file("x", 1).unwrap_err().code(),
        ErrorCode::WorkflowError
    );
    writer.begin_encryption().unwrap();
    assert_eq!(
        writer.write_data(b"data").unwrap_err().code(),
        ErrorCode::WorkflowError
    );
    // The writer stays usable after the misuse.
    writer.add_recipient(&Recipient::make_symmetric("t")).unwrap();
    writer.add_file("x", 4).unwrap();
    writer.write_data(b"data").unwrap();
    // Recipients are locked once payload started.
    assert_eq!(
        writer
            .add_recipient(&Recipient::make_symmetric("late"))
            .unwrap_err()
            .code(),
        ErrorCode::WorkflowError
    );
    writer.finish_encryption().unwrap();
    let container = writer.take_output().unwrap();

    let mut reader = open_reader_source(Cursor::new(container), &backend, None).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(
        reader.read_data(&mut buf).unwrap_err().code(),
        ErrorCode::WorkflowError
    );
    assert_eq!(
        reader.next_file().unwrap_err().code(),
        ErrorCode::WorkflowError
    );
    // Still usable afterwards.
    let lock = reader.locks()[0].clone();
    let fmk = reader.get_fmk(&lock).unwrap();
    reader.begin_decryption(&fmk).unwrap();
    assert!(reader.next_file().unwrap().is_some());
}

#[test]
fn empty_container_round_trips() {
    let backend = SoftKeyBackend::new().with_secret("t", &[6u8; 32]);
    let mut writer = Cdoc2Writer::new(Vec::new(), &backend, None);
    writer.begin_encryption().unwrap();
    writer.add_recipient(&Recipient::make_symmetric("t")).unwrap();
    writer.finish_encryption().unwrap();
    let container = writer.take_output().unwrap();

    let files = decrypt_all(&container, &backend).unwrap();
    assert!(files.is_empty());
}

#[test]
fn magic_gate_never_reports_crypto_errors() {
    let backend = SoftKeyBackend::new();
    for junk in [
        &b"PK\x03\x04not a cdoc"[..],
        &b"random bytes here"[..],
        &b"CDOC\x01legacy-version-byte"[..],
        &b""[..],
    ] {
        match open_reader_source(Cursor::new(junk.to_vec()), &backend, None) {
            Err(e) => assert_ne!(e.code(), ErrorCode::CryptoError),
            Ok(_) => panic!("junk accepted as a container"),
        }
    }
}

struct MapServer {
    store: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl NetworkBackend for MapServer {
    fn fetch_key(&self, _keyserver_id: &str, transaction_id: &str) -> Result<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| Error::Backend("no such transaction".into()))
    }

    fn send_key(
        &self,
        _keyserver_id: &str,
        _rcpt_key: &[u8],
        key_material: &[u8],
        _rsa: bool,
    ) -> Result<String> {
        let mut store = self.store.lock().unwrap();
        let tx = format!("TX{:04}", store.len());
        store.insert(tx.clone(), key_material.to_vec());
        Ok(tx)
    }
}

#[test]
fn key_server_lock_round_trip() {
    let server = MapServer { store: Default::default() };
    let (sk, pk) = crypto::generate_p384();
    let backend = SoftKeyBackend::new().with_ec_key("card", sk);

    let container = encrypt_files(
        &backend,
        Some(&server),
        &[Recipient::make_server("card", pk, false, "ks-test")],
        &[("s.txt", b"via key server")],
    );

    let mut reader =
        open_reader_source(Cursor::new(container), &backend, Some(&server)).unwrap();
    let lock = reader.locks()[0].clone();
    match &lock.kind {
        LockKind::Server { keyserver_id, .. } => assert_eq!(keyserver_id, "ks-test"),
        _ => panic!("expected a server lock"),
    }
    let fmk = reader.get_fmk(&lock).unwrap();
    let mut sink = VecConsumer::new();
    reader.decrypt(&fmk, &mut sink).unwrap();
    assert_eq!(sink.files[0].1, b"via key server");
}
