use std::env;

fn main() {
    // Default config file location, unless overridden at build time
    let config_path = env::var("CLAPTRAP_LISTEN_CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/claptrap-listen.conf".to_string());

    println!("cargo:rerun-if-env-changed=CLAPTRAP_LISTEN_CONFIG_PATH");

    println!("cargo:rustc-env=CLAPTRAP_LISTEN_CONFIG_PATH={}", config_path);
}
