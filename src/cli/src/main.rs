//! Composition root for the session-key authorization engine: wires an
//! in-memory store, a stub ledger/wallet, and the engine together so the
//! whole create → delegate → sign → spend → revoke flow can be driven
//! from one process without any external service.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use session_amount::Amount;
use session_engine::{CreateKeyRequest, DelegationRequest, EngineConfig, Manager, SignedSpendRequest};
use session_orchestrator::{NullEventEmitter, NullTransactionRecorder, Orchestrator, StubLedger, StubWallet};
use session_store::{CancellationToken, InMemoryStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

const ABOUT: &str = "session-cli — Alancoin session-key authorization engine demo";

#[derive(Debug, Parser)]
#[clap(name = "session-cli")]
#[clap(about = ABOUT, long_about = None)]
struct Cli {
    /// Emit debug-level traces.
    #[clap(long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate a secp256k1 keypair and print its address.
    Keygen,
    /// Run the full create → delegate → spend → revoke lifecycle once,
    /// printing each step and the resulting session-key state.
    Demo {
        /// Owner address funding the demo ledger.
        #[clap(long, default_value = "100.00")]
        fund: String,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn generate_keypair() -> (SecretKey, PublicKey, String) {
    let secp = Secp256k1::new();
    let mut rng = rand::rngs::OsRng;
    let (sk, pk) = secp.generate_keypair(&mut rng);
    let addr = session_crypto::address_from_public_key(&pk);
    (sk, pk, addr)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!("{}", ABOUT);

    match cli.command {
        Commands::Keygen => run_keygen(),
        Commands::Demo { fund } => run_demo(&fund).await,
    }
}

fn run_keygen() -> Result<()> {
    let (sk, _pk, addr) = generate_keypair();
    println!("secret_key: {}", hex::encode(sk.as_ref()));
    println!("address:    {addr}");
    Ok(())
}

async fn run_demo(fund: &str) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(Manager::new(store).with_config(EngineConfig::default()));
    let cancel = CancellationToken::new();

    let (owner_sk, _owner_pk, owner_addr) = generate_keypair();
    let (agent_sk, _agent_pk, agent_addr) = generate_keypair();
    let (sub_agent_sk, _sub_agent_pk, sub_agent_addr) = generate_keypair();

    println!("owner:      {owner_addr}");
    println!("agent:      {agent_addr}");
    println!("sub-agent:  {sub_agent_addr}");

    let root = engine
        .create(
            &owner_addr,
            CreateKeyRequest {
                public_key: agent_addr.clone(),
                max_per_tx: Some("10.00".to_string()),
                max_per_day: Some("50.00".to_string()),
                max_total: Some("50.00".to_string()),
                expires_in: Some("1h".to_string()),
                allow_any: true,
                label: Some("root agent key".to_string()),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .context("creating root session key")?;
    println!("created root session key {} (owner's direct agent)", root.id);

    let delegation_nonce = 1u64;
    let delegation_timestamp = Utc::now().timestamp();
    let child_max_total = "20.00";
    let delegation_msg = session_crypto::delegation_message(&sub_agent_addr, child_max_total, delegation_nonce, delegation_timestamp);
    let delegation_sig = session_crypto::sign_message(&agent_sk, &delegation_msg);

    let child = engine
        .create_delegated(
            &root.id,
            DelegationRequest {
                child_public_key: sub_agent_addr.clone(),
                max_total: Some(child_max_total.to_string()),
                max_per_tx: Some("5.00".to_string()),
                nonce: delegation_nonce,
                timestamp: delegation_timestamp,
                signature: hex::encode(delegation_sig),
                label: Some("sub-agent key".to_string()),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .context("delegating a sub-agent key")?;
    println!("delegated session key {} from {}", child.id, root.id);

    let ledger = Arc::new(StubLedger::new());
    ledger
        .fund(&owner_addr, Amount::parse(fund).map_err(|e| anyhow!(e.to_string()))?)
        .await;
    let orchestrator = Orchestrator::new(
        engine.clone(),
        ledger.clone(),
        Arc::new(StubWallet::new()),
        Arc::new(NullTransactionRecorder),
        Arc::new(NullEventEmitter),
    )
    .with_demo_mode(true);

    let recipient = "0x000000000000000000000000000000000000aa";
    let spend_nonce = 1u64;
    let spend_timestamp = Utc::now().timestamp();
    let spend_msg = session_crypto::spend_message(recipient, "3.00", spend_nonce, spend_timestamp);
    let spend_sig = session_crypto::sign_message(&sub_agent_sk, &spend_msg);
    let spend_req = SignedSpendRequest {
        to: recipient.to_string(),
        amount: "3.00".to_string(),
        service_id: None,
        nonce: spend_nonce,
        timestamp: spend_timestamp,
        signature: hex::encode(spend_sig),
    };
    let outcome = orchestrator
        .spend(&owner_addr, &child.id, spend_req, &cancel)
        .await
        .context("spending through the delegated key")?;
    println!(
        "spend settled: tx={} amount={} recipient_balance={}",
        outcome.tx_hash,
        outcome.amount,
        ledger.available_balance(recipient).await.format()
    );

    let tree = engine
        .subtree(&root.id, &cancel)
        .await
        .context("building the delegation subtree")?
        .ok_or_else(|| anyhow!("root key vanished"))?;
    println!(
        "root remaining={:?} total_spent={}",
        tree.remaining.map(|a| a.format()),
        tree.total_spent.format()
    );
    println!(
        "  child remaining={:?} total_spent={}",
        tree.children[0].remaining.map(|a| a.format()),
        tree.children[0].total_spent.format()
    );

    engine.revoke(&root.id, &cancel).await.context("revoking the root key cascades to delegates")?;
    let revoked_child = engine.get(&child.id, &cancel).await?;
    println!("after revoke, sub-agent key active = {}", revoked_child.is_active(Utc::now()));

    Ok(())
}
