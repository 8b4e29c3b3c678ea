fn main() {
    if let Err(err) = app::run() {
        eprintln!("reporter: {err:?}");
        std::process::exit(1);
    }
}
