use clap::Parser;

fn main() {
    outreachctl::init_tracing();
    let cli = outreachctl::Cli::parse();
    if let Err(err) = outreachctl::run(cli) {
        eprintln!("erro: {err}");
        std::process::exit(1);
    }
}
