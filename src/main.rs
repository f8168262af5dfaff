//! Command line front end for signing and verifying PDF documents.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use pdf_signer::{
    get_signature_info, load_certificate_chain, sign_pdf_with, CertificateStore, SignOptions,
    SignatureImage, SigningConfig,
};

#[derive(Parser)]
#[command(name = "pdf-signer")]
#[command(about = "Visible digital signatures for PDF documents")]
#[command(long_about = "
Signs PDF documents with a PKCS #12 keystore using incremental updates, and
verifies the signatures already embedded in a document.

ENVIRONMENT VARIABLES:
    DIGITAL_SIGNING_CERTIFICATE_PATH      Keystore used when --certificate is absent
    DIGITAL_SIGNING_CERTIFICATE_PASSWORD  Keystore password used when --password is absent
    DIGITAL_SIGNING_PLACEHOLDER_SIZE      Bytes reserved for the signature blob
    DIGITAL_SIGNING_FIELD_NAME            Name of the signature form field
    RUST_LOG                              Logging level (debug, info, warn, error)
")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign a PDF document
    Sign {
        /// PDF file to sign
        #[arg(value_name = "INPUT_FILE")]
        input: PathBuf,

        /// Where to write the signed document
        #[arg(short, long, value_name = "OUTPUT_FILE")]
        output: PathBuf,

        /// Handwritten signature graphic (PNG, JPEG or a base64 data URL)
        #[arg(short, long, value_name = "IMAGE_FILE")]
        image: Option<PathBuf>,

        /// Reason shown in the signature
        #[arg(short, long, default_value = "")]
        reason: String,

        /// Location shown in the signature
        #[arg(short, long, default_value = "")]
        location: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Verify every signature of a PDF document and print the results as JSON
    Verify {
        #[arg(value_name = "INPUT_FILE")]
        input: PathBuf,
    },

    /// Print the certificate chain of the keystore as JSON
    Chain {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Check that the signing configuration is usable
    CheckConfig,
}

#[derive(clap::Args)]
struct Credentials {
    /// PKCS #12 keystore (overrides configuration)
    #[arg(short, long, value_name = "KEYSTORE")]
    certificate: Option<PathBuf>,

    /// Keystore password (overrides configuration)
    #[arg(short, long)]
    password: Option<String>,
}

impl Credentials {
    fn resolve(self, config: &SigningConfig) -> Result<(PathBuf, String)> {
        let path = self.certificate.or_else(|| config.certificate_path.clone());
        let password = self
            .password
            .or_else(|| config.certificate_password.clone());
        match (path, password) {
            (Some(path), Some(password)) => Ok((path, password)),
            (None, _) => bail!(
                "no keystore given; use --certificate or DIGITAL_SIGNING_CERTIFICATE_PATH"
            ),
            (_, None) => bail!(
                "no keystore password given; use --password or DIGITAL_SIGNING_CERTIFICATE_PASSWORD"
            ),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = SigningConfig::from_env().context("Failed to read signing configuration")?;

    match cli.command {
        Commands::Sign {
            input,
            output,
            image,
            reason,
            location,
            credentials,
        } => {
            let (keystore, password) = credentials.resolve(&config)?;
            let bundle = CertificateStore::load(&keystore, &password)
                .with_context(|| format!("Failed to load keystore {}", keystore.display()))?;
            if !bundle.is_currently_valid() {
                warn!("signing certificate is outside of its validity period");
            }

            let pdf_bytes = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let image = image.as_deref().and_then(load_image);

            let options = SignOptions {
                reason: &reason,
                location: &location,
                field_name: &config.field_name,
                image: image.as_ref(),
                placeholder_size: config.placeholder_size,
                ..Default::default()
            };
            let signed = sign_pdf_with(&pdf_bytes, &options, &bundle)
                .with_context(|| format!("Failed to sign {}", input.display()))?;

            std::fs::write(&output, signed)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("wrote {}", output.display());
        }
        Commands::Verify { input } => {
            let pdf_bytes = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let results = get_signature_info(&pdf_bytes)
                .with_context(|| format!("Failed to verify {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Chain { credentials } => {
            let (keystore, password) = credentials.resolve(&config)?;
            let chain = load_certificate_chain(&keystore, &password)
                .with_context(|| format!("Failed to load keystore {}", keystore.display()))?;
            println!("{}", serde_json::to_string_pretty(&chain)?);
        }
        Commands::CheckConfig => {
            config.validate().context("Signing configuration is invalid")?;
            let (keystore, password) = config.credentials()?;
            CertificateStore::load(keystore, password)
                .with_context(|| format!("Failed to load keystore {}", keystore.display()))?;
            println!("Signing configuration is valid");
        }
    }

    Ok(())
}

/// A signature graphic that can not be decoded only costs the picture, not
/// the signature.
fn load_image(path: &Path) -> Option<SignatureImage> {
    let decoded = std::fs::read(path)
        .map_err(pdf_signer::Error::from)
        .and_then(|bytes| match std::str::from_utf8(&bytes) {
            Ok(text) if text.trim_start().starts_with("data:") => {
                SignatureImage::from_data_url(text.trim())
            }
            _ => SignatureImage::from_bytes(&bytes),
        });
    match decoded {
        Ok(image) => Some(image),
        Err(e) => {
            warn!("ignoring signature image {}: {e}", path.display());
            None
        }
    }
}
