//! `cdoc` — encrypt, decrypt and inspect CDoc containers from the shell.
//!
//! Key material is held in an in-memory software backend; hardware tokens
//! and key servers are out of scope for this tool.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use cdoc_core::{
    create_writer, open_reader, CdocReader, CdocWriter, FileListConsumer, FileListSource,
    Lock, LockKind, Recipient, SoftKeyBackend,
};

#[derive(Parser)]
#[command(name = "cdoc", version, about = "CDoc container encryption tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt files into a container
    Encrypt(EncryptArgs),
    /// Decrypt a container into a directory
    Decrypt(DecryptArgs),
    /// List the recipient locks of a container
    Locks { file: PathBuf },
}

#[derive(Args)]
struct KeyArgs {
    /// Pre-shared key, as label:hex
    #[arg(long = "secret", value_name = "LABEL:HEX")]
    secrets: Vec<String>,
    /// Password, as label:text
    #[arg(long = "password", value_name = "LABEL:TEXT")]
    passwords: Vec<String>,
    /// P-384 private key, as label:hex (raw scalar)
    #[arg(long = "ec-key", value_name = "LABEL:HEX")]
    ec_keys: Vec<String>,
    /// RSA private key, as label:path (PKCS#8 DER file)
    #[arg(long = "rsa-key", value_name = "LABEL:PATH")]
    rsa_keys: Vec<String>,
}

#[derive(Args)]
struct EncryptArgs {
    /// Output container path
    #[arg(long, short)]
    out: PathBuf,
    /// Write the legacy CDoc1 format instead of CDoc2
    #[arg(long)]
    cdoc1: bool,
    /// Certificate recipient, as label:path (DER file)
    #[arg(long = "cert", value_name = "LABEL:PATH")]
    certs: Vec<String>,
    /// Raw P-384 public key recipient, as label:hex (SEC1 point)
    #[arg(long = "pubkey", value_name = "LABEL:HEX")]
    pubkeys: Vec<String>,
    /// PBKDF2 iterations for password recipients
    #[arg(long, default_value_t = 100_000)]
    kdf_iter: u32,
    #[command(flatten)]
    keys: KeyArgs,
    /// Files to encrypt
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Args)]
struct DecryptArgs {
    /// Container to decrypt
    file: PathBuf,
    /// Output directory
    #[arg(long, short, default_value = ".")]
    out: PathBuf,
    /// Only try the lock with this label
    #[arg(long)]
    label: Option<String>,
    #[command(flatten)]
    keys: KeyArgs,
}

fn split_pair(s: &str) -> Result<(&str, &str)> {
    s.split_once(':')
        .ok_or_else(|| anyhow!("expected label:value, got {s:?}"))
}

fn build_backend(keys: &KeyArgs) -> Result<SoftKeyBackend> {
    let mut backend = SoftKeyBackend::new();
    for s in &keys.secrets {
        let (label, hex_key) = split_pair(s)?;
        let key = hex::decode(hex_key).context("secret is not valid hex")?;
        backend = backend.with_secret(label, &key);
    }
    for s in &keys.passwords {
        let (label, pw) = split_pair(s)?;
        backend = backend.with_secret(label, pw.as_bytes());
    }
    for s in &keys.ec_keys {
        let (label, hex_key) = split_pair(s)?;
        let scalar = hex::decode(hex_key).context("EC key is not valid hex")?;
        backend = backend.with_ec_key_bytes(label, &scalar)?;
    }
    for s in &keys.rsa_keys {
        let (label, path) = split_pair(s)?;
        let der = fs::read(path).with_context(|| format!("reading {path}"))?;
        backend = backend.with_rsa_key_der(label, &der)?;
    }
    Ok(backend)
}

fn describe(lock: &Lock) -> &'static str {
    match &lock.kind {
        LockKind::Cdoc1Rsa { .. } => "cdoc1 rsa certificate",
        LockKind::Cdoc1Ecc { .. } => "cdoc1 ec certificate",
        LockKind::PublicKeyRsa { .. } => "rsa public key",
        LockKind::PublicKeyEcc { .. } => "ec public key",
        LockKind::Server { .. } => "key server",
        LockKind::Symmetric { .. } => "symmetric key",
        LockKind::Password { .. } => "password",
    }
}

fn encrypt(args: EncryptArgs) -> Result<()> {
    let backend = build_backend(&args.keys)?;
    let mut recipients = Vec::new();
    for s in &args.certs {
        let (label, path) = split_pair(s)?;
        let der = fs::read(path).with_context(|| format!("reading {path}"))?;
        recipients.push(Recipient::make_certificate(label, der));
    }
    for s in &args.pubkeys {
        let (label, hex_key) = split_pair(s)?;
        let point = hex::decode(hex_key).context("public key is not valid hex")?;
        recipients.push(Recipient::make_ecc_key(label, point));
    }
    for s in &args.keys.secrets {
        let (label, _) = split_pair(s)?;
        recipients.push(Recipient::make_symmetric(label));
    }
    for s in &args.keys.passwords {
        let (label, _) = split_pair(s)?;
        recipients.push(Recipient::make_password(label, args.kdf_iter));
    }
    if recipients.is_empty() {
        bail!("no recipients given");
    }

    let version = if args.cdoc1 { 1 } else { 2 };
    let mut writer = create_writer(version, &args.out, &backend, None)?;
    let mut source = FileListSource::new(args.files.clone());
    writer.encrypt(&mut source, &recipients)?;
    println!("wrote {}", args.out.display());
    Ok(())
}

fn decrypt(args: DecryptArgs) -> Result<()> {
    let backend = build_backend(&args.keys)?;
    let mut reader = open_reader(&args.file, &backend, None)?;
    let locks: Vec<Lock> = reader.locks().to_vec();
    if locks.is_empty() {
        bail!("container has no usable locks");
    }
    fs::create_dir_all(&args.out)?;

    let mut last_err = None;
    for lock in locks {
        if let Some(wanted) = &args.label {
            if &lock.label != wanted {
                continue;
            }
        }
        match reader.get_fmk(&lock) {
            Ok(fmk) => {
                let mut consumer = FileListConsumer::new(&args.out);
                reader.decrypt(&fmk, &mut consumer)?;
                println!("decrypted into {}", args.out.display());
                return Ok(());
            }
            Err(e) => {
                log::debug!("lock {:?} did not open: {e}", lock.label);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e).context("no lock could be opened with the given keys"),
        None => bail!("no lock matched the requested label"),
    }
}

fn locks(file: PathBuf) -> Result<()> {
    let backend = SoftKeyBackend::new();
    let reader = open_reader(&file, &backend, None)?;
    for lock in reader.locks() {
        println!("{}\t{}", lock.label, describe(lock));
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Encrypt(args) => encrypt(args),
        Command::Decrypt(args) => decrypt(args),
        Command::Locks { file } => locks(file),
    }
}
