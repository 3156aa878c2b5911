use comuna_commons::start_everything;

fn main() {
    match start_everything("info", comuna_bot::entry()) {
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
