fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match shop::cli::run(args) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
