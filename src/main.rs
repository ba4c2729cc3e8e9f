//! ALFA Token Seal - CLI
//!
//! Command-line front end for the credential sealer.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use alfa_token_seal::{
    AuthToken, BiometricAuthenticator, BiometricCapability, Completion, CredentialSealer,
    DemoLoginSource, EnclaveConfig, FailureReason, FileBlobStore, PasswordLogin, PromptRequest,
    PromptResult, SealError, SealKey, SealResult, SealedBlobStore, SealerConfig, SoftwareEnclave,
};

#[derive(Parser)]
#[command(name = "alfa-seal")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_token_seal::VERSION)]
#[command(about = "ALFA Token Seal - Biometric-gated credential storage")]
struct Cli {
    /// Storage directory
    #[arg(short, long, default_value = "./alfa_seal_store")]
    store: PathBuf,

    /// JSON settings file ({ "sealer": {...}, "enclave": {...} }).
    /// The enclave state defaults to <store>/enclave.state
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Behave as a device without enrolled biometrics
    #[arg(long)]
    no_biometrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show biometric capability and stored credential status
    Status,

    /// Show metadata of the stored wrapper (never the token)
    Inspect,

    /// Unseal the stored credential behind a prompt (prints its length only)
    Unseal,

    /// Remove the stored credential
    Forget,

    /// Log in, seal the issued token, then unseal it again
    Demo {
        /// Username
        #[arg(short, long)]
        user: String,

        /// Password
        #[arg(short, long)]
        password: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    sealer: SealerConfig,
    enclave: EnclaveConfig,
}

impl Settings {
    fn load(path: Option<&Path>) -> SealResult<Self> {
        match path {
            Some(path) => {
                let data = std::fs::read(path)?;
                Ok(serde_json::from_slice(&data)?)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Terminal stand-in for a fingerprint sensor
struct ConsoleSensor {
    pairing_key: SealKey,
    capability: BiometricCapability,
}

impl BiometricAuthenticator for ConsoleSensor {
    fn capability(&self) -> BiometricCapability {
        self.capability
    }

    fn present(&self, request: PromptRequest) -> oneshot::Receiver<PromptResult> {
        let (sender, receiver) = oneshot::channel();
        let pairing_key = self.pairing_key.clone();

        println!();
        println!("👆 {}", request.info.title);
        println!("   {}", request.info.subtitle);
        println!("   [y] touch sensor   [n] wrong finger   [anything else] {}", request.info.negative_button);

        std::thread::spawn(move || {
            let mut line = String::new();
            let answer = std::io::stdin().lock().read_line(&mut line).map(|_| line.trim().to_lowercase());

            let result = match answer.as_deref() {
                Ok("y") => PromptResult::Authenticated(AuthToken::issue(&pairing_key, request.challenge, 1)),
                Ok("n") => PromptResult::Failed(FailureReason::NotRecognized),
                Ok(_) => PromptResult::Cancelled,
                Err(e) => PromptResult::Failed(FailureReason::Hardware(e.to_string())),
            };
            let _ = sender.send(result);
        });

        receiver
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        if e.requires_reenrollment() {
            eprintln!("Biometric enrollment changed - log in with your password again.");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> SealResult<()> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if settings.enclave.state_path.is_none() {
        settings.enclave.state_path = Some(cli.store.join("enclave.state"));
    }

    let pairing_key = SealKey::generate();
    let enclave = Arc::new(SoftwareEnclave::open(pairing_key.clone(), settings.enclave)?);
    let sensor = Arc::new(ConsoleSensor {
        pairing_key,
        capability: if cli.no_biometrics {
            BiometricCapability::NotEnrolled
        } else {
            BiometricCapability::Available
        },
    });
    let backend = Arc::new(FileBlobStore::new(&cli.store));
    let sealer = CredentialSealer::new(settings.sealer, enclave, sensor, backend.clone());

    match cli.command {
        Commands::Status => {
            println!("📊 ALFA Token Seal Status");
            println!("{:-<40}", "");
            println!("Store:              {}", cli.store.display());
            println!("Biometrics usable:  {}", if sealer.can_use_biometrics() { "yes" } else { "no" });
            println!("Credential stored:  {}", if sealer.has_sealed_credential()? { "yes" } else { "no" });
        }

        Commands::Inspect => {
            let config = sealer.config();
            let store = SealedBlobStore::new(backend);
            match store.load(&config.namespace, &config.blob_key)? {
                Some(wrapper) => {
                    println!("🔐 Sealed wrapper");
                    println!("{:-<40}", "");
                    println!("IV ({} bytes):       {}", wrapper.initialization_vector.len(), hex::encode(&wrapper.initialization_vector));
                    println!("Ciphertext ({} bytes):", wrapper.ciphertext.len());
                    println!("  {}", STANDARD.encode(&wrapper.ciphertext));
                }
                None => println!("📭 No sealed credential"),
            }
        }

        Commands::Unseal => match sealer.unseal(|token| token.expose_secret().chars().count()).await? {
            Completion::Completed(len) => println!("✅ Token unsealed ({} chars)", len),
            Completion::Cancelled => println!("↩️ Unsealing cancelled"),
        },

        Commands::Forget => {
            sealer.forget()?;
            println!("🗑️ Sealed credential removed");
        }

        Commands::Demo { user, password } => {
            println!("🎮 ALFA Token Seal - Demo Mode");
            println!("{:-<40}", "");

            let principal = DemoLoginSource.login(&user, &password)?;
            println!("✅ Logged in as {}", principal.identity);

            match sealer.seal(principal).await? {
                Completion::Completed(()) => println!("✅ Token sealed"),
                Completion::Cancelled => {
                    println!("↩️ Sealing cancelled - nothing stored");
                    return Ok(());
                }
            }

            match sealer.unseal(|token| token.expose_secret().chars().count()).await {
                Ok(Completion::Completed(len)) => println!("✅ Token unsealed ({} chars)", len),
                Ok(Completion::Cancelled) => println!("↩️ Unsealing cancelled"),
                Err(SealError::NothingToUnseal) => println!("📭 Nothing to unseal"),
                Err(e) => return Err(e),
            }

            println!();
            println!("Unseal again later with:");
            println!("  alfa-seal --store {} unseal", cli.store.display());
        }
    }

    Ok(())
}
