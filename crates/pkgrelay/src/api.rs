//! Mirror catalog exposed under `/api/mirrors`.

use pkgrelay_config::Config;
use pkgrelay_types::{MirrorKind, mirror_id};
use serde::Serialize;

/// One configured mirror as shown to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMirror {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MirrorKind,
    pub name: String,
    pub source_url: String,
    pub target_url: String,
    pub icon: String,
    pub enabled: bool,
    pub usage: String,
}

/// Assemble the catalog from the configuration, every kind in a stable
/// order and disabled mirrors included.
pub fn mirror_catalog(config: &Config) -> Vec<ServiceMirror> {
    let mut catalog = Vec::new();
    let public = &config.public_server;

    for (code, conf) in &config.git {
        let target_url = format!("{}/git/{}", public, conf.server);
        catalog.push(ServiceMirror {
            id: mirror_id(MirrorKind::Git, code),
            kind: MirrorKind::Git,
            name: code.clone(),
            source_url: conf.server.clone(),
            target_url: target_url.clone(),
            icon: conf.icon.clone(),
            enabled: conf.enabled,
            usage: format!(
                "You can download a zip file with the following url:\n\n    \
                 {target_url}/path/repository/REFERENCE.zip\n\n\
                 The reference can be a branch, a tag or a commit; tags and commits are \
                 served from a dedicated cache location.\n\n\
                 You can clone a repository with:\n\n    \
                 git clone {target_url}/path/repository.git\n"
            ),
        });
    }

    for (code, conf) in &config.npm {
        let target_url = format!("{public}/npm/{code}");
        catalog.push(ServiceMirror {
            id: mirror_id(MirrorKind::Npm, code),
            kind: MirrorKind::Npm,
            name: code.clone(),
            source_url: conf.server.clone(),
            target_url: target_url.clone(),
            icon: conf.icon.clone(),
            enabled: conf.enabled,
            usage: format!(
                "Point the registry at the mirror:\n\n    \
                 npm set registry {target_url}\n\n\
                 Downloaded archives are kept on a dedicated cache location. The setting \
                 is global to all projects running in the current environment.\n"
            ),
        });
    }

    for (code, conf) in &config.composer {
        let target_url = format!("{public}/composer/{code}");
        catalog.push(ServiceMirror {
            id: mirror_id(MirrorKind::Composer, code),
            kind: MirrorKind::Composer,
            name: code.clone(),
            source_url: conf.server.clone(),
            target_url: target_url.clone(),
            icon: conf.icon.clone(),
            enabled: conf.enabled,
            usage: format!(
                "Declare the mirror in your composer.json file:\n\n    \
                 \"repositories\":[\n        {{ \"packagist\": false }},\n        \
                 {{ \"type\": \"composer\", \"url\": \"{target_url}\"}}\n    ],\n\n\
                 The composer mirror rewrites archive urls to point at the local git \
                 mirror; make sure the matching git mirror is configured.\n"
            ),
        });
    }

    for (code, conf) in &config.bower {
        let target_url = format!("{public}/bower/{code}");
        catalog.push(ServiceMirror {
            id: mirror_id(MirrorKind::Bower, code),
            kind: MirrorKind::Bower,
            name: code.clone(),
            source_url: conf.server.clone(),
            target_url: target_url.clone(),
            icon: conf.icon.clone(),
            enabled: conf.enabled,
            usage: format!(
                "Declare the mirror in your .bowerrc file:\n\n    \
                 {{\n        \"registry\": {{\n            \"search\": [\"{target_url}\"],\n            \
                 \"register\": \"{target_url}\"\n        }}\n    }}\n"
            ),
        });
    }

    for (code, conf) in &config.statics {
        let target_url = format!("{public}/static/{code}");
        catalog.push(ServiceMirror {
            id: mirror_id(MirrorKind::Static, code),
            kind: MirrorKind::Static,
            name: code.clone(),
            source_url: conf.server.clone(),
            target_url: target_url.clone(),
            icon: conf.icon.clone(),
            enabled: conf.enabled,
            usage: format!(
                "Reference a file as {target_url}/myfile.zip; the mirror retrieves it \
                 from {} and keeps a local copy.\n",
                conf.server
            ),
        });
    }

    catalog
}
