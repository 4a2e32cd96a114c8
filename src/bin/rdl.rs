use std::env;

use resumable_dl::cli::{self, Command, Outcome};

fn print_usage() {
    eprintln!("Usage: rdl [OPTIONS] <asset-id> <url>");
    eprintln!("       rdl [OPTIONS] --status <asset-id>");
    eprintln!("       rdl [OPTIONS] --remove <asset-id>");
    eprintln!("       rdl [OPTIONS] --list");
    eprintln!();
    eprintln!("Downloads <url> in parallel byte-range segments. Interrupted downloads");
    eprintln!("resume from the segments already on disk; press Ctrl-C to pause.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>  Config file (default: platform config dir)");
    eprintln!("  -h, --help           Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!(
        "  {}    Storage root override",
        resumable_dl::config::ROOT_ENV_VAR
    );
    eprintln!("  RUST_LOG             Log filter (default: warn)");
}

#[tokio::main]
async fn main() -> resumable_dl::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match cli::parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("Error: {msg}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };
    if args.command == Command::Help {
        print_usage();
        return Ok(());
    }

    match cli::run(args).await? {
        Outcome::Failed(_) => std::process::exit(1),
        Outcome::Completed(_) | Outcome::Paused | Outcome::Done => Ok(()),
    }
}
