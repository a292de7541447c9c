//! GPU driver detection from machine metadata and execution logs.

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use tracegate_client::GpuDriver;
use tracing::warn;

lazy_static! {
    static ref GL_VENDOR: Regex = Regex::new(r"^OpenGL vendor string: (.*)$").unwrap();
    static ref GL_RENDERER: Regex = Regex::new(r"^OpenGL renderer string: (.*)$").unwrap();
    /// `4.6 (Core Profile) Mesa 22.1.0-devel (git-5d8c659678)`
    static ref GL_MESA_VERSION: Regex = Regex::new(
        r"^OpenGL core profile version string: \d\.\d \(Core Profile\) Mesa (\d+\.\d+\.\d+)(-devel \(git-([a-z0-9]+)\))?$"
    )
    .unwrap();
    /// `4.6.14739 Core Profile Context`
    static ref GL_PRO_VERSION: Regex =
        Regex::new(r"^OpenGL core profile version string: \d\.\d\.(\d+) Core Profile Context$").unwrap();
    static ref DXVK_DEVICE_NAME: Regex = Regex::new(r"^.*Device name[:\s]+(.+)$").unwrap();
    static ref DXVK_DRIVER_VERSION: Regex = Regex::new(r"^.*Driver version[:\s]+([\d.]+)$").unwrap();
    static ref LIBGL_LOADER: Regex =
        Regex::new(r"^libGL: MESA-LOADER: dlopen\(/usr/lib/dri/(\w+)_dri\.so\)$").unwrap();
}

/// Release branch of a radv build: `X.99.Z` is `main`, `X.Y.Z` is `vX.Y.y`.
pub fn radv_branch_from_version(version: &str) -> Option<String> {
    let fields: Vec<&str> = version.split('.').collect();
    match fields.as_slice() {
        [_, "99", _] => Some("main".to_string()),
        [major, minor, _] => Some(format!("v{}.{}.y", major, minor)),
        _ => {
            warn!(version, "unknown driver version format");
            None
        }
    }
}

/// Parsed `gfxinfo.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct GfxInfo {
    fields: serde_json::Map<String, serde_json::Value>,
    pub machine_tags: Vec<String>,
}

impl GfxInfo {
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))?;
        let fields = match value {
            serde_json::Value::Object(map) => map,
            _ => return Err("expected a JSON object".to_string()),
        };
        let machine_tags = fields
            .get("tags")
            .and_then(|t| t.as_array())
            .map(|tags| tags.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();

        Ok(Self {
            fields,
            machine_tags,
        })
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::parse(&text)
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.machine_tags.iter().find_map(|t| t.strip_prefix(prefix))
    }

    pub fn gpu_pciid(&self) -> Option<&str> {
        self.tag_value("amdgpu:pciid:")
    }

    pub fn gpu_codename(&self) -> Option<&str> {
        self.tag_value("amdgpu:codename:")
    }

    /// Vulkan driver of the machine.
    pub fn vk_driver(&self) -> GpuDriver {
        let name = self.field("vk:driver:name").map(|name| match name {
            "AMD open-source driver" => "amdvlk".to_string(),
            "AMD proprietary driver" => "amdgpu-pro".to_string(),
            other => other.to_string(),
        });

        let (version, commit, branch) = match self.field("mesa:version") {
            Some(version) => (
                Some(version.to_string()),
                self.field("mesa:git:version").map(String::from),
                radv_branch_from_version(version),
            ),
            None => (self.field("vk:driver:info").map(String::from), None, None),
        };

        GpuDriver {
            name,
            version,
            branch,
            commit,
        }
    }

    /// Machine metadata attached to every registered execution.
    pub fn all_fields(&self) -> serde_json::Value {
        let get = |name: &str| self.fields.get(name).cloned().unwrap_or(serde_json::Value::Null);
        json!({
            "machine_tags": self.machine_tags,
            "driver": {
                "name": get("vk:driver:name"),
                "info": get("vk:driver:info"),
                "mesa_version": get("mesa:version"),
                "mesa_git_version": get("mesa:git:version"),
            },
            "device": {
                "name": get("vk:device:name"),
                "type": get("vk:device:type"),
            },
            "memory": {
                "vram_size_gib": get("vk:vram_size_gib"),
                "gtt_size_gib": get("vk:gtt_size_gib"),
            }
        })
    }
}

/// OpenGL driver signature from `glxinfo` output.
pub fn parse_glxinfo(text: &str) -> Option<GpuDriver> {
    let mut vendor: Option<String> = None;
    let mut driver: Option<String> = None;
    let mut version: Option<String> = None;
    let mut branch: Option<String> = None;
    let mut commit: Option<String> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if let Some(c) = GL_VENDOR.captures(line) {
            let v = c[1].to_string();
            match v.as_str() {
                "AMD" => driver = Some("radeonsi".to_string()),
                "Advanced Micro Devices, Inc." => driver = Some("amdgpu".to_string()),
                _ => {}
            }
            vendor = Some(v);
        } else if let Some(c) = GL_RENDERER.captures(line) {
            let renderer = &c[1];
            if renderer == "zink" {
                driver = Some("zink".to_string());
            } else if driver.is_none() {
                driver = Some(format!(
                    "unknown ({} / {})",
                    vendor.as_deref().unwrap_or("None"),
                    renderer
                ));
            }
        } else if let Some(c) = GL_MESA_VERSION.captures(line) {
            let v = c[1].to_string();
            let fields: Vec<&str> = v.split('.').collect();
            if let [major, minor, _] = fields.as_slice() {
                // glxinfo cannot tell main from release builds
                branch = Some(format!("{}.{}.y", major, minor));
            }
            commit = c.get(3).map(|m| m.as_str().to_string());
            version = Some(v);
        } else if let Some(c) = GL_PRO_VERSION.captures(line) {
            version = Some(c[1].to_string());
        }
    }

    match (driver, version) {
        (Some(name), Some(version)) => Some(GpuDriver {
            name: Some(name),
            version: Some(version),
            branch,
            commit,
        }),
        _ => None,
    }
}

/// Vulkan driver as reported by DXVK in an execution log.
pub fn dxvk_driver_from_log(log: &str) -> Option<GpuDriver> {
    let mut name: Option<String> = None;
    let mut version: Option<String> = None;
    let mut branch: Option<String> = None;

    for line in log.lines() {
        let line = line.trim_end();
        if let Some(c) = DXVK_DEVICE_NAME.captures(line) {
            let device = c[1].trim();
            if device.starts_with("AMD RADV") {
                name = Some("radv".to_string());
            } else if device.ends_with("AMD GPU") {
                name = Some("amdvlk/gpu-pro".to_string());
            }
        }
        if let Some(c) = DXVK_DRIVER_VERSION.captures(line) {
            let v = c[1].to_string();
            branch = if name.as_deref() == Some("radv") {
                radv_branch_from_version(&v)
            } else {
                Some("main".to_string())
            };
            version = Some(v);
        }
    }

    if name.is_none() && version.is_none() {
        return None;
    }
    Some(GpuDriver {
        name,
        version,
        branch,
        commit: None,
    })
}

/// Mesa OpenGL driver loaded by the replay, e.g. `zink` or `radeonsi`.
pub fn libgl_driver_from_log(log: &str) -> Option<String> {
    log.lines()
        .find_map(|line| LIBGL_LOADER.captures(line.trim_end()).map(|c| c[1].to_string()))
}

/// Driver that ran an execution.
///
/// The log decides first (Mesa GL loader, then DXVK), falling back to the
/// trace's graphics API.
pub fn detect_driver(
    log: Option<&str>,
    graphics_api: Option<&str>,
    gfxinfo: &GfxInfo,
    glxinfo: &GpuDriver,
) -> GpuDriver {
    if let Some(log) = log {
        if let Some(libgl) = libgl_driver_from_log(log) {
            if glxinfo.name.as_deref() == Some(libgl.as_str()) {
                return glxinfo.clone();
            }
            return GpuDriver::new(libgl, "UNK");
        }
        if let Some(dxvk) = dxvk_driver_from_log(log) {
            return gfxinfo.vk_driver().merge(&dxvk);
        }
    }

    if graphics_api == Some("OpenGL") {
        glxinfo.clone()
    } else {
        gfxinfo.vk_driver()
    }
}
