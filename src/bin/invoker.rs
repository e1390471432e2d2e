fn main() {
    std::process::exit(invoker::cli::run())
}
