fn main() {
    if let Err(e) = dockyard_lib::run() {
        eprintln!("dockyard: {}", e);
        std::process::exit(1);
    }
}
