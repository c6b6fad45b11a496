//! Simple client example against a running node.
//!
//! Start a node first:
//!   cargo run --bin sqlraft -- --id 1 /tmp/sqlraft-node1
//!
//! Then run this example:
//!   cargo run --example simple_client

use anyhow::Result;
use client::Client;

#[tokio::main]
async fn main() -> Result<()> {
    let client = Client::new("localhost:9301")?;
    println!("Using {}", client.base_url());

    client
        .execute("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
        .await?;

    for (name, age) in [("Alice", 30), ("Bob", 25)] {
        let result = client
            .execute(&format!(
                "INSERT INTO users (name, age) VALUES ('{}', {})",
                name, age
            ))
            .await?;
        println!("Inserted {} row(s)", result.rows_affected);
    }

    let rows = client
        .query("SELECT name, age FROM users WHERE age > 26")
        .await?;
    println!("Columns: {:?}", rows.columns);
    for row in &rows.values {
        println!("  {:?}", row);
    }

    match client.execute("INSERT INTO nowhere VALUES (1)").await {
        Err(e) if e.is_database_error() => println!("Expected failure: {}", e),
        other => println!("Unexpected: {:?}", other),
    }

    let status = client.status().await?;
    println!("Leader: {}", status["store"]["leader"]);
    Ok(())
}
