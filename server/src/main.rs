#[tokio::main]
async fn main() {
    sharecart::start_server().await;
}
