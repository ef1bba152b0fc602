fn main() {
    match liverec::run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("liverec: {error} (errno {})", error.errno());
            std::process::exit(1);
        }
    }
}
