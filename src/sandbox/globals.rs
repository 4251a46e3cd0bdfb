//! The global names a preflight script may see.
//!
//! Every other own property of the engine's global object is deleted before
//! the script runs. The check is exhaustive: if a name cannot be removed the
//! sandbox refuses to start.

/// Built-ins and sandbox-provided functions visible to scripts
pub const ALLOWED_GLOBALS: &[&str] = &[
    "Array",
    "Atomics",
    "BigInt",
    "Boolean",
    "DataView",
    "Date",
    "Error",
    "EvalError",
    "Infinity",
    "JSON",
    "Map",
    "Math",
    "NaN",
    "Number",
    "Object",
    "Promise",
    "Proxy",
    "RangeError",
    "ReferenceError",
    "Reflect",
    "RegExp",
    "Set",
    "String",
    "Symbol",
    "SyntaxError",
    "TypeError",
    "URIError",
    "WeakMap",
    "WeakSet",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    "escape",
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "undefined",
    "unescape",
    "btoa",
    "atob",
    "fetch",
    "setTimeout",
];

/// Objects installed by the sandbox itself
pub const SANDBOX_OBJECTS: &[&str] = &["console", "lab"];

/// Whether `name` may remain on the global object
pub fn is_visible_global(name: &str) -> bool {
    ALLOWED_GLOBALS.contains(&name) || SANDBOX_OBJECTS.contains(&name)
}

/// Names handed to the prelude, which prunes everything else
pub(crate) fn visible_globals() -> Vec<String> {
    ALLOWED_GLOBALS
        .iter()
        .chain(SANDBOX_OBJECTS)
        .map(|name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_code_and_buffers_are_not_allowed() {
        for name in [
            "eval",
            "Function",
            "globalThis",
            "ArrayBuffer",
            "SharedArrayBuffer",
            "Uint8Array",
            "require",
            "setInterval",
            "queueMicrotask",
        ] {
            assert!(!is_visible_global(name), "{} must not be visible", name);
        }
    }

    #[test]
    fn test_sandbox_objects_are_visible() {
        assert!(is_visible_global("console"));
        assert!(is_visible_global("lab"));
        assert!(is_visible_global("fetch"));
        assert_eq!(visible_globals().len(), ALLOWED_GLOBALS.len() + 2);
    }
}
