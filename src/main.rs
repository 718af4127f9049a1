use claptrap_listen::MainContext;

fn main() {
    let cli_args: Vec<String> = std::env::args().collect();

    // the config path baked in at build time can be overridden at run time
    let config_path = std::env::var("CLAPTRAP_LISTEN_CONFIG")
        .unwrap_or_else(|_| env!("CLAPTRAP_LISTEN_CONFIG_PATH").to_string());

    let ctx = MainContext {
        args: cli_args,
        config_path,
    };

    claptrap_listen::main(&ctx);
}
