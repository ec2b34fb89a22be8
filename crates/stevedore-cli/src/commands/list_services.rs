//! `stevectl list-services`

use crate::client::{ApiClient, ClientError};

pub fn run(client: &ApiClient) -> Result<(), ClientError> {
    let services = client.list_services()?;
    println!(
        "{:<32} {:<16} {:<40} {:<8} POLICIES",
        "WORKLOAD", "CONTAINER", "IMAGE", "STATUS"
    );
    for service in services {
        let policy = if service.locked {
            "locked".to_string()
        } else if service.automated {
            "automated".to_string()
        } else {
            String::new()
        };
        if service.containers.is_empty() {
            println!("{:<32} {:<16} {:<40} {:<8} {policy}", service.id.to_string(), "", "", service.status);
            continue;
        }
        for (i, container) in service.containers.iter().enumerate() {
            let (id, status, policy) = if i == 0 {
                (service.id.to_string(), service.status.as_str(), policy.as_str())
            } else {
                (String::new(), "", "")
            };
            println!(
                "{id:<32} {:<16} {:<40} {status:<8} {policy}",
                container.name,
                container.image.to_string(),
            );
        }
    }
    Ok(())
}
