//! CLI tool for creating a root CA for interception
//!
//! Usage:
//!   crab-ca [--cn <name>] [--days <n>] [--algorithm ecdsa-p256|rsa-2048|rsa-4096]
//!           [--out-cert <path>] [--out-key <path>]

use anyhow::Result;
use clap::Parser;
use crab_mitm::{generate_ca_files, logging, KeyAlgorithm};
use std::path::PathBuf;
use tracing::info;

/// Generate a root CA certificate and private key
#[derive(Parser, Debug)]
#[command(name = "crab-ca")]
#[command(author = "CrabProxy Contributors")]
#[command(version)]
#[command(about = "Generate a root CA for crab-mitm")]
struct Args {
    /// Common name of the CA
    #[arg(long, default_value = "CrabProxy Root CA")]
    cn: String,

    /// Validity in days
    #[arg(long, default_value = "3650")]
    days: u32,

    /// Key algorithm
    #[arg(long, default_value = "ecdsa-p256")]
    algorithm: KeyAlgorithm,

    /// Certificate output path
    #[arg(long, default_value = "./ca/crab-ca.pem")]
    out_cert: PathBuf,

    /// Private key output path, written with owner-only permissions
    #[arg(long, default_value = "./ca/crab-ca.key")]
    out_key: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init("info");

    for path in [&args.out_cert, &args.out_key] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    generate_ca_files(&args.cn, args.days, &args.out_cert, &args.out_key, args.algorithm)?;

    info!("Generated {} CA {:?}", args.algorithm, args.cn);
    println!("Certificate: {}", args.out_cert.display());
    println!("Private key: {}", args.out_key.display());
    Ok(())
}
