use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = std::env::args_os().nth(1).map(PathBuf::from);
    toolmesh::run(config).await
}
