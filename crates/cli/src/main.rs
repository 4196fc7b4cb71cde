//! The abroot binary; all logic lives in abroot-lib.

fn main() {
    abroot_lib::cli::main()
}
