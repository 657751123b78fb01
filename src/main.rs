use clap::Parser;
use dotenv::dotenv;
use fxconv::cli::{self, Cli};
use fxconv::logger;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Cli::parse();
    logger::init_cli_logger(args.verbose);

    match cli::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            cli::exit_code(&e)
        }
    }
}
