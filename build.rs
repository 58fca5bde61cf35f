use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set, skipping C header");
            return;
        }
    };

    // C header shared with the boot stages
    let header_path = Path::new(&crate_dir).join("include/norcow_storage.h");
    if let Some(parent) = header_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            println!("cargo:warning=Failed to create include/ directory: {}", e);
        }
    }

    let bindings = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("NORCOW_STORAGE_H")
        .with_cpp_compat(true)
        .generate();

    match bindings {
        Ok(bindings) => {
            if !bindings.write_to_file(&header_path) {
                println!("cargo:warning=norcow_storage.h unchanged");
            }
        }
        Err(e) => println!("cargo:warning=cbindgen generation failed: {}", e),
    }

    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=build.rs");
}
