use std::path::Path;

use crate::commands::common::App;
use crate::error::CliError;

pub async fn run_login(email: &str, password: &str, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let client = app.client().await?;

    let session = app.sessions.login(&client, email, password).await?;
    let name = if session.full_name.is_empty() {
        session.user_id.as_str()
    } else {
        session.full_name.as_str()
    };
    println!("Logged in as {name}");
    Ok(())
}

pub async fn run_logout(db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    app.sessions.logout().await?;
    println!("Logged out");
    Ok(())
}
