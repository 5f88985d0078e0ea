use anyhow::Context;

fn main() -> anyhow::Result<()> {
  let args: Vec<String> = std::env::args().collect();

  if args.iter().any(|a| a == "--version") {
    println!("{}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }

  let scan_args = scanner::ScanArgs::from_args(&args)?;
  scanner::run(scan_args).context("scanner run")
}
