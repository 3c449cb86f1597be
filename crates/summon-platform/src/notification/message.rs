//! Chat attachments announcing deploys and failures

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use summon_common::crd::SummonPlatform;

/// Colour of a successful deploy
pub const COLOR_GOOD: &str = "good";
/// Colour of a failure
pub const COLOR_DANGER: &str = "danger";

/// A structured chat message
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Attachment {
    /// Headline
    pub title: String,
    /// Where the headline links to
    pub title_link: String,
    /// Sidebar colour
    pub color: String,
    /// Body
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Plain-text rendering for clients without attachments
    pub fallback: String,
    /// Short key/value pairs below the body
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<AttachmentField>,
}

/// One key/value pair of an attachment
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AttachmentField {
    /// Label
    pub title: String,
    /// Value, may contain `<url|text>` links
    pub value: String,
    /// Render side by side with the next field
    pub short: bool,
}

/// `<build>-<sha>-<branch>` parts of a CI-built image tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildTag {
    /// CI build number
    pub build: String,
    /// Short commit hash
    pub commit: String,
    /// Branch the build came from
    pub branch: String,
}

fn build_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)-([0-9a-fA-F]+)-(\S+)$").ok())
        .as_ref()
}

/// Split a CI-built version; other versions yield `None`
pub fn parse_build_tag(version: &str) -> Option<BuildTag> {
    let caps = build_tag_regex()?.captures(version)?;
    Some(BuildTag {
        build: caps[1].to_string(),
        commit: caps[2].to_string(),
        branch: caps[3].to_string(),
    })
}

fn version_fields(repository: &str, version: &str) -> Vec<AttachmentField> {
    let Some(tag) = parse_build_tag(version) else {
        return Vec::new();
    };
    let field = |title: &str, url: String, text: &str| AttachmentField {
        title: title.to_string(),
        value: format!("<{url}|{text}>"),
        short: true,
    };
    vec![
        field(
            "Build",
            format!("https://circleci.com/gh/Ridecell/{repository}/{}", tag.build),
            &tag.build,
        ),
        field(
            "Commit",
            format!("https://github.com/Ridecell/{repository}/commit/{}", tag.commit),
            &tag.commit,
        ),
        field(
            "Branch",
            format!("https://github.com/Ridecell/{repository}/tree/{}", tag.branch),
            &tag.branch,
        ),
    ]
}

fn site(top: &SummonPlatform) -> String {
    format!("https://{}/", top.spec.hostname)
}

/// Announcement of `component` reaching `version`
pub fn deploy_attachment(top: &SummonPlatform, component: &str, repository: &str, version: &str) -> Attachment {
    let title = format!("{} Deployed {} {}", top.spec.hostname, component, version);
    Attachment {
        fallback: title.clone(),
        title,
        title_link: site(top),
        color: COLOR_GOOD.to_string(),
        text: String::new(),
        fields: version_fields(repository, version),
    }
}

/// Announcement of a failed reconcile
pub fn error_attachment(top: &SummonPlatform, message: &str) -> Attachment {
    let title = format!("{} Deployment failed", top.spec.hostname);
    Attachment {
        fallback: format!("{title}: {message}"),
        title,
        title_link: site(top),
        color: COLOR_DANGER.to_string(),
        text: message.to_string(),
        fields: version_fields("summon-platform", &top.spec.version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use summon_common::crd::SummonPlatformSpec;

    fn platform(version: &str) -> SummonPlatform {
        SummonPlatform::new(
            "foo",
            SummonPlatformSpec {
                hostname: "foo.ridecell.us".into(),
                version: version.into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn build_tags_split_into_parts() {
        assert_eq!(
            parse_build_tag("1234-abc1234-feature-x"),
            Some(BuildTag {
                build: "1234".into(),
                commit: "abc1234".into(),
                branch: "feature-x".into(),
            })
        );
        assert_eq!(parse_build_tag("1.2.3"), None);
        assert_eq!(parse_build_tag("12-nothex-master"), None);
    }

    #[test]
    fn deploy_attachment_links_build_commit_and_branch() {
        let a = deploy_attachment(&platform(""), "summon", "summon-platform", "15-ab0f6c1-TestTag");
        assert_eq!(a.color, COLOR_GOOD);
        assert_eq!(a.title_link, "https://foo.ridecell.us/");
        let titles: Vec<_> = a.fields.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["Build", "Commit", "Branch"]);
        assert_eq!(
            a.fields[1].value,
            "<https://github.com/Ridecell/summon-platform/commit/ab0f6c1|ab0f6c1>"
        );
    }

    #[test]
    fn plain_versions_have_no_fields() {
        let a = error_attachment(&platform("1.2.3"), "postgres: boom");
        assert_eq!(a.color, COLOR_DANGER);
        assert_eq!(a.text, "postgres: boom");
        assert!(a.fields.is_empty());
        assert!(a.fallback.ends_with("postgres: boom"));
    }

    #[test]
    fn attachment_wire_names() {
        let v = serde_json::to_value(error_attachment(&platform("1.2.3"), "x")).unwrap();
        assert!(v.get("title_link").is_some());
        assert!(v.get("fields").is_none());
    }
}
