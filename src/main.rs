use clap::App;
use clap::Arg;

#[tokio::main(flavor = "multi_thread", worker_threads = 3)]
async fn main() {
    let matches = App::new("Huck")
        .version("0.1.0")
        .about("Replicated state machine in rust.")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .required(true)
                .default_value("Config.toml")
                .help("Location of the config file."),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let shutdown = tokio::sync::broadcast::channel(1);
    huck::huck(config_path, shutdown).await.unwrap();
}
