use clap::Parser;
use comuna_bot::{run_admin, AdminCli};
use comuna_commons::start_everything;

fn main() {
    let cli = AdminCli::parse();
    match start_everything("warn", run_admin(cli)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to start the runtime: {e}");
            std::process::exit(1);
        }
    }
}
