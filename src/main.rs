use anyhow::{bail, Result};
use clap::Parser;
use bitcoin::Network;
use crossbeam_channel::RecvTimeoutError;

use wallet_synchronizer::config::{ElectrumConfig, SyncConfig, DEFAULT_ELECTRUM_URL};
use wallet_synchronizer::persistence;
use wallet_synchronizer::{ElectrumTransport, MemoryWallet, Notification, SyncStats, Synchronizer, WalletStore};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = DEFAULT_ELECTRUM_URL)]
    electrum_url: String,

    #[arg(long, default_value = "testnet")]
    network: Network,

    /// Address to watch. Repeat for more.
    #[arg(long = "address")]
    addresses: Vec<String>,

    #[arg(long, default_value = "wallet.json")]
    wallet_file: PathBuf,

    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Stop as soon as the wallet is up to date.
    #[arg(long)]
    exit_when_synced: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let wallet = Arc::new(persistence::load_or_create(&args.wallet_file, &args.addresses)?);
    if wallet.watched_addresses().is_empty() {
        bail!("nothing to watch: pass at least one --address");
    }

    println!("[MAIN] Connecting to Electrum: {}", args.electrum_url);
    let transport = Arc::new(ElectrumTransport::start(ElectrumConfig::new(
        args.electrum_url.clone(),
        args.network,
    ))?);
    let notifications = transport.notifications();

    let config = SyncConfig::default().with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    let t0 = Instant::now();
    let handle = Synchronizer::new(wallet.clone(), transport, config).spawn()?;

    loop {
        match notifications.recv_timeout(Duration::from_millis(500)) {
            Ok(Notification::NewTransaction) => {
                log::info!("[MAIN] {} transactions in wallet", wallet.transaction_count());
                if let Err(e) = persistence::save(&wallet, &args.wallet_file) {
                    log::error!("[MAIN] saving wallet failed: {:#}", e);
                }
            }
            Ok(Notification::Updated) => {
                if wallet.is_up_to_date() {
                    log::info!("[MAIN] Wallet up to date after {:?}", t0.elapsed());
                    if args.exit_when_synced {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = handle.stop()?;
    persistence::save(&wallet, &args.wallet_file)?;
    print_summary(&wallet, &stats, t0.elapsed());

    Ok(())
}

fn print_summary(wallet: &MemoryWallet, stats: &SyncStats, elapsed: Duration) {
    println!("[MAIN] Sync Finished");
    println!("-----------------------------------");
    println!("Total Time:       {:?}", elapsed);
    println!("Addresses:        {}", wallet.watched_addresses().len());
    println!("Transactions:     {}", wallet.transaction_count());
    println!("Messages:         {}", stats.messages);
    println!("Histories:        {}", stats.histories_stored);
    println!("Integrity errors: {}", stats.integrity_failures);
    println!("Sessions:         {}", stats.sessions);
    println!("-----------------------------------");
}
