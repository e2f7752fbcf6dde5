use chain_signers::init_logger;
use clap::Parser;
use pmm_settler::{run_settler, SettlerArgs};

#[tokio::main]
async fn main() -> pmm_settler::Result<()> {
    let args = SettlerArgs::parse();

    init_logger(&args.log_level).expect("Logger should initialize");

    run_settler(args).await
}
