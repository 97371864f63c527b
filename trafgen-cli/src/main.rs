//! Command line interface for trafgen.
//!
//! Loads a JSON stream profile, then prints the compiled programs or plays
//! the streams in virtual time and prints what would have been sent.

#[cfg(not(target_arch = "wasm32"))]
use mimalloc::MiMalloc;
#[cfg(not(target_arch = "wasm32"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    trafgen_cli::lib_main()
}
