//! Records held by the instance store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A challenge definition: what to run and which secret to embed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    pub id: i64,
    pub name: String,
    /// Single image to run
    pub docker_image: Option<String>,
    /// Compose definition (YAML or JSON), takes precedence over the image
    pub docker_compose: Option<String>,
    /// Service port inside the container
    pub target_port: Option<u16>,
    /// Secret injected as `FLAG`
    pub flag: String,
    /// Whether instances of this lab expire
    pub time_limit: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a lab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLab {
    pub name: String,
    pub docker_image: Option<String>,
    pub docker_compose: Option<String>,
    pub target_port: Option<u16>,
    pub flag: String,
    pub time_limit: bool,
}

impl NewLab {
    pub fn new(name: &str, flag: &str) -> Self {
        Self {
            name: name.to_string(),
            docker_image: None,
            docker_compose: None,
            target_port: None,
            flag: flag.to_string(),
            time_limit: true,
        }
    }

    pub fn image(mut self, image: &str) -> Self {
        self.docker_image = Some(image.to_string());
        self
    }

    pub fn compose(mut self, definition: &str) -> Self {
        self.docker_compose = Some(definition.to_string());
        self
    }

    pub fn target_port(mut self, port: u16) -> Self {
        self.target_port = Some(port);
        self
    }

    pub fn time_limit(mut self, time_limit: bool) -> Self {
        self.time_limit = time_limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// One per-user, per-lab container allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabInstance {
    pub id: i64,
    pub lab_id: i64,
    pub user_id: i64,
    /// Runtime-assigned container id, fixed at creation
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    /// Published address; `None` while the runtime has not reported one
    pub container_ip: Option<String>,
    pub container_port: Option<u16>,
    /// `None` means the instance never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl LabInstance {
    /// Whether the instance's lifetime ended at or before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Fields for recording a freshly provisioned instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLabInstance {
    pub lab_id: i64,
    pub user_id: i64,
    pub container_id: String,
    pub container_name: String,
    pub container_ip: Option<String>,
    pub container_port: Option<u16>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewLabInstance {
    /// The stored row for this instance under the given id
    pub fn into_instance(self, id: i64) -> LabInstance {
        LabInstance {
            id,
            lab_id: self.lab_id,
            user_id: self.user_id,
            container_id: Some(self.container_id),
            container_name: Some(self.container_name),
            container_ip: self.container_ip,
            container_port: self.container_port,
            expires_at: self.expires_at,
            is_active: true,
            created_at: self.created_at,
        }
    }
}
