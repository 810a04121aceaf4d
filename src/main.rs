fn main() {
    if let Err(e) = kds_board::run() {
        eprintln!("kds-board: {e:#}");
        std::process::exit(1);
    }
}
