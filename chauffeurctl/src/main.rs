use clap::Parser;

fn main() {
    let cli = chauffeurctl::Cli::parse();
    if let Err(err) = chauffeurctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
