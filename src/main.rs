fn main() {
    let args = std::env::args();
    if let Err(err) = casfs::run(args) {
        eprintln!("casfs error: {err}");
        std::process::exit(1);
    }
}
