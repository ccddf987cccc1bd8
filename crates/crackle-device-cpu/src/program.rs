use crate::kernel::{CpuKernel, Defines, KernelRegistry};
use crackle_device_api::{DeviceError, Kernel, Program};
use std::collections::HashMap;
use std::sync::Arc;

/// What `create_kernel` stores inside a [`Kernel`] for this runtime.
pub(crate) struct CpuKernelHandle {
    pub(crate) kernel: Arc<dyn CpuKernel>,
    pub(crate) defines: Arc<Defines>,
}

pub struct CpuProgram {
    context: u32,
    options: String,
    kernels: HashMap<String, Arc<dyn CpuKernel>>,
    defines: Arc<Defines>,
}

impl CpuProgram {
    pub(crate) fn build(
        context: u32,
        registry: &KernelRegistry,
        source: &[u8],
        options: &str,
    ) -> Result<Self, DeviceError> {
        let fail = |reason: String| DeviceError::Build { context, reason };
        let names = parse_manifest(source).map_err(fail)?;
        let defines = parse_options(options).map_err(fail)?;
        let mut kernels = HashMap::with_capacity(names.len());
        for name in names {
            let k = registry
                .get(&name)
                .ok_or_else(|| fail(format!("unknown kernel `{name}`")))?;
            kernels.insert(name, k);
        }
        Ok(Self {
            context,
            options: options.to_string(),
            kernels,
            defines: Arc::new(defines),
        })
    }

    pub fn defines(&self) -> &Defines {
        &self.defines
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Program for CpuProgram {
    fn context(&self) -> u32 {
        self.context
    }

    fn build_options(&self) -> &str {
        &self.options
    }

    fn create_kernel(&self, name: &str) -> Result<Kernel, DeviceError> {
        let kernel = self
            .kernels
            .get(name)
            .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))?;
        let handle = CpuKernelHandle { kernel: kernel.clone(), defines: self.defines.clone() };
        Ok(Kernel::new(name, Arc::new(handle)))
    }
}

/// Program sources for the host runtime are kernel manifests:
///
/// ```text
/// # comment
/// kernel md5_search
/// ```
pub fn parse_manifest(source: &[u8]) -> Result<Vec<String>, String> {
    let text = std::str::from_utf8(source).map_err(|e| format!("source is not utf-8: {e}"))?;
    let mut names = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let line = match line.find("//") {
            Some(i) => &line[..i],
            None => line,
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (None, _, _) => {}
            (Some("kernel"), Some(name), None) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            _ => return Err(format!("line {}: expected `kernel <name>`, got `{}`", lineno + 1, raw.trim())),
        }
    }
    if names.is_empty() {
        return Err("program declares no kernels".into());
    }
    Ok(names)
}

/// Parses `-DNAME[=VALUE]` / `-D NAME[=VALUE]` options; `-w` and `-cl-*`
/// flags are accepted and ignored.
pub fn parse_options(options: &str) -> Result<Defines, String> {
    let mut defines = Defines::default();
    let mut tokens = options.split_whitespace();
    while let Some(tok) = tokens.next() {
        let def = if tok == "-D" {
            tokens.next().ok_or("`-D` without a definition")?
        } else if let Some(rest) = tok.strip_prefix("-D") {
            rest
        } else if tok == "-w" || tok.starts_with("-cl-") {
            continue;
        } else {
            return Err(format!("unrecognized build option `{tok}`"));
        };
        let (name, value) = match def.split_once('=') {
            Some((n, v)) => (n, v),
            None => (def, "1"),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid define name in `{tok}`"));
        }
        defines.insert(name, value);
    }
    Ok(defines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_lists_kernels() {
        let src = b"# header\nkernel a\n\n  kernel b // trailing\nkernel a\n";
        assert_eq!(parse_manifest(src).unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn manifest_rejects_garbage() {
        assert!(parse_manifest(b"__kernel void f() {}").is_err());
        assert!(parse_manifest(b"# only comments\n").is_err());
        assert!(parse_manifest(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn options_parse_defines() {
        let d = parse_options("-DLEN=8 -D FAST -cl-mad-enable -w").unwrap();
        assert_eq!(d.get_u64("LEN"), Some(8));
        assert_eq!(d.get("FAST"), Some("1"));
        assert_eq!(d.len(), 2);
        assert!(parse_options("").unwrap().is_empty());
    }

    #[test]
    fn options_reject_unknown_flags() {
        assert!(parse_options("-O3").is_err());
        assert!(parse_options("-D").is_err());
        assert!(parse_options("-D=3").is_err());
        assert!(parse_options("-DBAD-NAME=1").is_err());
    }
}
