//! Binary entry point for the `latchkey` tool.

fn main() {
    std::process::exit(latchkey_cli::run());
}
