fn main() {
    if let Err(e) = leisure_proxy_lib::run() {
        eprintln!("leisure-proxy: {e}");
        std::process::exit(1);
    }
}
