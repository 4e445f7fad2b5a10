use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    securechat_lib::run()
        .await
        .context("securechat client stopped with an error")
}
