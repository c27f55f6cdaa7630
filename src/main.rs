// src/main.rs
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use mazurka::{Config, Server};

fn main() {
    let mut config = Config::from_env();
    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse() {
            Ok(port) => config.port = port,
            Err(_) => {
                eprintln!("usage: mazurka [port]");
                std::process::exit(1);
            }
        }
    }

    println!(
        "mazurka serving {} on {} ({} workers)",
        config.doc_root,
        config.server_addr(),
        config.workers
    );

    if let Err(e) = Server::new(config).serve() {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}
