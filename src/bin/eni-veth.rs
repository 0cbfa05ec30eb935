use eni_veth::commands::{error_reply, run_cni};
use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() {
    // stdout carries the CNI result, logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        let reply = error_reply(&err);
        match serde_json::to_string(&reply) {
            Ok(json) => println!("{}", json),
            Err(_) => println!(
                r#"{{"cniVersion":"1.0.0","code":{},"msg":"internal error"}}"#,
                reply.code
            ),
        }
        std::process::exit(1);
    }
}
