use clap::Parser;

use twap_runway::api::{Cli, Command, run_cli_command, run_http_server};
use twap_runway::logging::{resolve_log_level, setup_logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(&resolve_log_level(cli.log_level.as_deref()), cli.log_json);

    if let Command::Serve { port } = cli.command {
        if let Err(e) = run_http_server(port).await {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        }
        return;
    }

    match run_cli_command(&cli.command) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
