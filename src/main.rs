use pipeline_worker_lib::{cli::parse_args, commands::run_worker};

#[tokio::main]
async fn main() {
    let args = parse_args();
    std::process::exit(run_worker(args, "worker").await);
}
