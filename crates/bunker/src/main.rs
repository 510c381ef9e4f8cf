//! Operator entry points for the session-protection and backup core.
//!
//! Backup runs are driven by the embedding client process (which owns the
//! state store); this binary covers the out-of-band operations that need
//! nothing but the configuration and the archive files themselves.

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};

use bunker_core::{
    archive, config::Config, crypto::Cipher, ports::ObjectStore, restore,
    snapshot::SnapshotDocument, vault::SessionVault,
};
use bunker_s3::S3ObjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bunker_core::logging::init("bunker")?;

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        bail!("missing command");
    };

    let cfg = Arc::new(Config::load()?);
    let cipher = Arc::new(Cipher::new(&cfg.encryption_key)?);

    match command.as_str() {
        "inspect" => {
            let path = arg(&args, 1, "archive path")?;
            let doc = restore::restore_archive(Path::new(&path), &cipher)?;
            print_summary(&doc);
        }
        "restore" => {
            let path = arg(&args, 1, "archive path")?;
            let out = flag_value(&args, "--out")
                .context("restore requires --out <file> for the decrypted snapshot")?;

            let doc = restore::restore_archive(Path::new(&path), &cipher)?;
            fs::write(&out, serde_json::to_vec_pretty(&doc)?)
                .with_context(|| format!("write {out}"))?;

            print_summary(&doc);
            println!("snapshot written to {out}");
            println!("re-inserting into the state store is a separate, explicit step");
        }
        "validate" => {
            let session_id = arg(&args, 1, "session id")?;
            let vault = SessionVault::new(cfg.clone(), cipher.clone());
            if vault.validate(&session_id).await {
                println!("session {session_id}: OK");
            } else {
                println!("session {session_id}: NOT VALID");
                std::process::exit(1);
            }
        }
        "upload" => {
            let path = PathBuf::from(arg(&args, 1, "archive path")?);
            let Some(remote_cfg) = &cfg.remote else {
                bail!("remote storage is not configured (set S3_BUCKET)");
            };

            let file_name = path
                .file_name()
                .and_then(|s| s.to_str())
                .context("invalid archive path")?;
            let strategy = file_name
                .split('_')
                .next()
                .filter(|s| !s.is_empty())
                .context("cannot derive strategy from archive file name")?;

            let key = archive::remote_key(&remote_cfg.key_prefix, strategy, file_name);
            let store = S3ObjectStore::new(remote_cfg).await?;
            store.put_file(&key, &path).await?;
            println!("uploaded s3://{}/{}", remote_cfg.bucket, key);
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}");
        }
    }

    Ok(())
}

fn arg(args: &[String], idx: usize, what: &str) -> anyhow::Result<String> {
    args.get(idx)
        .cloned()
        .with_context(|| format!("missing {what}"))
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn print_summary(doc: &SnapshotDocument) {
    println!("strategy:   {}", doc.strategy);
    println!("created at: {}", doc.created_at);
    for collection in &doc.collections {
        println!("  {:<12} {:>6} records", collection.name, collection.records.len());
    }
    println!("total:      {:>6} records", doc.record_count());
}

fn print_usage() {
    eprintln!(
        "usage: bunker <command>\n\
         \n\
         commands:\n\
         \x20 inspect  <archive>               decrypt an archive and show collection counts\n\
         \x20 restore  <archive> --out <file>  decrypt an archive to a plaintext snapshot file\n\
         \x20 validate <session-id>            check that a session's artifacts decrypt cleanly\n\
         \x20 upload   <archive>               re-push an archive to remote storage"
    );
}
