//! `stevectl list-images`

use crate::client::{ApiClient, ClientError};

/// Rows shown per container before eliding the rest.
const MAX_IMAGES_SHOWN: usize = 10;

pub fn run(client: &ApiClient, service: Option<&str>) -> Result<(), ClientError> {
    let statuses = client.list_images(service)?;
    println!(
        "{:<32} {:<16} {:<48} CREATED",
        "WORKLOAD", "CONTAINER", "IMAGE"
    );
    for status in statuses {
        let mut first_row = true;
        for container in &status.containers {
            let shown = container.available.iter().take(MAX_IMAGES_SHOWN);
            let mut container_row = true;
            for image in shown {
                let workload = if first_row {
                    status.id.to_string()
                } else {
                    String::new()
                };
                let name = if container_row {
                    container.name.clone()
                } else {
                    String::new()
                };
                let marker = if image.id == container.current {
                    "* "
                } else {
                    "  "
                };
                let created = image
                    .created_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{workload:<32} {name:<16} {marker}{:<46} {created}",
                    image.id.to_string()
                );
                first_row = false;
                container_row = false;
            }
            if container.available.len() > MAX_IMAGES_SHOWN {
                println!(
                    "{:<32} {:<16}   ({} more)",
                    "",
                    "",
                    container.available.len() - MAX_IMAGES_SHOWN
                );
            }
            if container.available.is_empty() {
                let workload = if first_row {
                    status.id.to_string()
                } else {
                    String::new()
                };
                println!(
                    "{workload:<32} {:<16} * {:<46} (current)",
                    container.name,
                    container.current.to_string()
                );
                first_row = false;
            }
        }
    }
    Ok(())
}
