use lumenx::{ClientConfig, LoginRequest, LumenClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Example usage - replace with your actual deployment settings
    let config = ClientConfig::from_env()
        .unwrap_or_else(|_| ClientConfig::new("http://localhost:4000", "dev-storage-key"));

    let client = LumenClient::new(config)?;

    println!("Signing in...");
    match client
        .login(LoginRequest {
            email: "demo@lumen.example".to_string(),
            password: "password".to_string(),
            device_name: None,
        })
        .await
    {
        Ok(session) => {
            println!("Signed in as {} ({:?})", session.user.email, session.user.role);

            let _watcher = client.on_notification(|notification| {
                println!("[{}] {}", notification.category, notification.title);
            });

            client.connect_channels().await?;
            println!("Channels connected; listening for 30 seconds...");
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;

            client.logout().await;
            println!("Signed out");
        }
        Err(e) => {
            println!("Login failed: {}", e);
        }
    }

    Ok(())
}
