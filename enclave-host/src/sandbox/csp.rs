//! Content-Security-Policy construction.

use enclave_types::CspAllowList;

/// Builds the policy applied to a container from its allow-lists.
///
/// Anything not listed falls back to `default-src 'none'`. Blob URLs are
/// always allowed as script sources so injected entry code can load.
pub fn build_policy(allow: &CspAllowList) -> String {
    let mut script_src = allow.script_src.clone();
    if !script_src.iter().any(|s| s == "blob:") {
        script_src.push("blob:".into());
    }

    let directives: [(&str, &[String]); 5] = [
        ("script-src", &script_src),
        ("style-src", &allow.style_src),
        ("connect-src", &allow.connect_src),
        ("img-src", &allow.img_src),
        ("font-src", &allow.font_src),
    ];

    let mut parts = vec!["default-src 'none'".to_string()];
    for (name, sources) in directives {
        if sources.is_empty() {
            continue;
        }
        parts.push(format!("{name} {}", sources.join(" ")));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        assert_eq!(
            build_policy(&CspAllowList::default()),
            "default-src 'none'; script-src 'self' blob:; style-src 'self' 'unsafe-inline'; \
             connect-src 'self'; img-src 'self' data:; font-src 'self'"
        );
    }

    #[test]
    fn empty_lists_are_omitted() {
        let allow = CspAllowList {
            script_src: vec!["https://cdn.test".into(), "blob:".into()],
            style_src: vec![],
            connect_src: vec!["https://api.test".into()],
            img_src: vec![],
            font_src: vec![],
        };
        assert_eq!(
            build_policy(&allow),
            "default-src 'none'; script-src https://cdn.test blob:; connect-src https://api.test"
        );
    }
}
