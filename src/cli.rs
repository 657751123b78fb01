use crate::config::{FxConfig, COMMON_CODES};
use crate::converter::Converter;
use crate::error::FxError;
use crate::models::{normalize_code, Conversion, RatesSnapshot};
use crate::money::format_amount;
use anyhow::Context;
use clap::Parser;
use rust_decimal::Decimal;
use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
    str::FromStr,
};
use tracing::debug;

/// Currency converter backed by cached exchange rates.
///
/// Without `--from`, `--to` and `--amount` the missing values are prompted for.
#[derive(Parser, Debug)]
#[command(name = "fxconv", version, about)]
pub struct Cli {
    /// Source currency code, e.g. USD
    #[arg(long = "from", value_name = "CODE")]
    pub from_code: Option<String>,

    /// Target currency code, e.g. UZS
    #[arg(long = "to", value_name = "CODE")]
    pub to_code: Option<String>,

    /// Amount to convert
    #[arg(long)]
    pub amount: Option<Decimal>,

    /// List supported currency codes and exit
    #[arg(long)]
    pub list: bool,

    /// With --list, print every rate relative to this currency
    #[arg(long, value_name = "CODE", requires = "list")]
    pub base: Option<String>,

    /// Force refresh rates (ignore cache)
    #[arg(long)]
    pub refresh: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn run(args: Cli) -> anyhow::Result<()> {
    let config = FxConfig::from_env();
    debug!(?config, "Loaded configuration");
    let converter = Converter::from_config(config).context("failed to set up converter")?;

    if args.list {
        return match args.base.as_deref() {
            Some(base) => {
                let snapshot = converter.rates_for(base).await?;
                warn_if_degraded(snapshot.degraded());
                print_rates(&snapshot);
                Ok(())
            }
            None => {
                let codes: Vec<String> = converter.list_supported().into_iter().collect();
                println!("Supported currency codes: {}", codes.join(", "));
                println!("Common currency codes: {}", COMMON_CODES.join(", "));
                Ok(())
            }
        };
    }

    if args.refresh {
        let base = converter.config().base.clone();
        let snapshot = converter.refresh(&base).await?;
        debug!(source = ?snapshot.source, "Refreshed rates");
    }

    let (from_code, to_code, amount) = match (args.from_code, args.to_code, args.amount) {
        (Some(from), Some(to), Some(amount)) => (from, to, amount),
        (from, to, amount) => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            prompt_missing(&mut stdin.lock(), &mut stdout.lock(), from, to, amount)?
        }
    };

    let conversion = converter.convert(amount, &from_code, &to_code).await?;
    warn_if_degraded(conversion.degraded);
    println!("{}", render(&conversion));
    Ok(())
}

pub fn exit_code(err: &anyhow::Error) -> ExitCode {
    ExitCode::from(exit_status(err))
}

/// 2 for rejected input, 1 for everything else.
pub fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<FxError>() {
        Some(FxError::UnknownCurrency(_)) | Some(FxError::InvalidAmount(_)) => 2,
        _ => 1,
    }
}

pub fn render(conversion: &Conversion) -> String {
    let request = &conversion.request;
    format!(
        "{} {} = {} {}",
        format_amount(request.amount, &request.from_code),
        request.from_code,
        format_amount(conversion.result, &request.to_code),
        request.to_code
    )
}

/// Accepts `1,234.5` style input.
pub fn parse_amount(input: &str) -> Result<Decimal, FxError> {
    let cleaned = input.trim().replace(',', "");
    Decimal::from_str(&cleaned).map_err(|_| FxError::InvalidAmount(input.trim().to_string()))
}

fn prompt_missing<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    from: Option<String>,
    to: Option<String>,
    amount: Option<Decimal>,
) -> anyhow::Result<(String, String, Decimal)> {
    writeln!(output, "Common currency codes: {}", COMMON_CODES.join(", "))?;
    writeln!(output, "Tip: you can also run with flags, e.g. --from USD --to UZS --amount 25")?;

    let from = match from {
        Some(code) => code,
        None => normalize_code(&prompt(input, output, "From currency code (e.g., USD): ")?),
    };
    let to = match to {
        Some(code) => code,
        None => normalize_code(&prompt(input, output, "To currency code (e.g., UZS): ")?),
    };
    let amount = match amount {
        Some(amount) => amount,
        None => parse_amount(&prompt(input, output, "Amount: ")?)?,
    };
    Ok((from, to, amount))
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> anyhow::Result<String> {
    write!(output, "{}", label)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        anyhow::bail!("unexpected end of input");
    }
    Ok(line.trim().to_string())
}

fn print_rates(snapshot: &RatesSnapshot) {
    println!("Exchange rates for {}:", snapshot.base);
    for (code, rate) in snapshot.rates.iter() {
        println!("{}: {}", code, rate);
    }
}

fn warn_if_degraded(degraded: bool) {
    if degraded {
        eprintln!("Warning: live rates unavailable; using cached or default rates.");
    }
}
