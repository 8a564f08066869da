use std::{
    ffi::{c_char, CStr, CString},
    fmt::Debug,
    ops::Deref,
};

use ash::{extensions::ext, vk};

use crate::{cstr, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Version(pub(crate) u32);
impl Version {
    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }
    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }
    pub fn raw(&self) -> u32 {
        self.0
    }
}
impl Default for Version {
    fn default() -> Self {
        Self::new(0, 0, 1, 0)
    }
}
impl Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Version({}.{}.{})", self.major(), self.minor(), self.patch())
    }
}

pub struct InstanceCreateInfo {
    pub application_name: CString,
    pub application_version: Version,
    pub api_version: Version,
    /// Enables `VK_LAYER_KHRONOS_validation` and routes its messages into `tracing`.
    pub enable_validation: bool,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            application_name: CString::from(cstr!("vkrt")),
            application_version: Default::default(),
            api_version: Version::new(0, 1, 2, 0),
            enable_validation: false,
        }
    }
}

pub struct Instance {
    entry: ash::Entry,
    instance: ash::Instance,
    api_version: Version,
    debug_utils: Option<DebugUtilsMessenger>,
}

impl Instance {
    pub fn create(info: &InstanceCreateInfo) -> Result<Self> {
        // Safety: the loaded library is kept alive by `entry` for as long as the instance lives.
        let entry = unsafe { ash::Entry::load()? };

        let mut layers: Vec<*const c_char> = Vec::new();
        let mut extensions: Vec<*const c_char> = Vec::new();
        if info.enable_validation {
            layers.push(cstr!("VK_LAYER_KHRONOS_validation").as_ptr());
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let application_info = vk::ApplicationInfo {
            p_application_name: info.application_name.as_ptr(),
            application_version: info.application_version.0,
            p_engine_name: cstr!("vkrt").as_ptr(),
            engine_version: Version::new(0, 0, 1, 0).0,
            api_version: info.api_version.0,
            ..Default::default()
        };
        let create_info = vk::InstanceCreateInfo {
            p_application_info: &application_info,
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };
        // Safety: No Host Syncronization rules for vkCreateInstance.
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let debug_utils = if info.enable_validation {
            match DebugUtilsMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };
        tracing::info!(api_version = ?info.api_version, validation = info.enable_validation, "created instance");
        Ok(Self {
            entry,
            instance,
            api_version: info.api_version,
            debug_utils,
        })
    }
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }
    pub fn api_version(&self) -> Version {
        self.api_version
    }
}

impl Deref for Instance {
    type Target = ash::Instance;
    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // Safety: every object created from this instance holds an Arc to it,
        // so nothing else can use it at this point.
        self.debug_utils = None;
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

struct DebugUtilsMessenger {
    debug_utils: ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugUtilsMessenger {
    fn new(entry: &ash::Entry, instance: &ash::Instance) -> ash::prelude::VkResult<Self> {
        let debug_utils = ext::DebugUtils::new(entry, instance);
        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(
                &vk::DebugUtilsMessengerCreateInfoEXT {
                    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                    message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    pfn_user_callback: Some(debug_utils_callback),
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self {
            debug_utils,
            messenger,
        })
    }
}

impl Drop for DebugUtilsMessenger {
    fn drop(&mut self) {
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

unsafe extern "system" fn debug_utils_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = &*callback_data;
    let message_id_name = if callback_data.p_message_id_name.is_null() {
        cstr!("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name)
    };
    let message = if callback_data.p_message.is_null() {
        cstr!("")
    } else {
        CStr::from_ptr(callback_data.p_message)
    };
    let id = callback_data.message_id_number;
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(message = ?message_id_name, id, detail = ?message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(message = ?message_id_name, id, detail = ?message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(message = ?message_id_name, id, detail = ?message)
        }
        _ => tracing::debug!(message = ?message_id_name, id, detail = ?message),
    }
    // The application should always return VK_FALSE.
    vk::FALSE
}
