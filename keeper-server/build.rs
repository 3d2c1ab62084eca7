fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Pass through KEEPER_GIT_HASH from the release environment
    println!("cargo:rerun-if-env-changed=KEEPER_GIT_HASH");
    if let Ok(hash) = std::env::var("KEEPER_GIT_HASH") {
        println!("cargo:rustc-env=KEEPER_GIT_HASH={}", hash);
    }
}
