//! Text dependency trees as printed by `gradle dependencies` and
//! `mvn dependency:tree`.
//!
//! Both tools draw the tree with a nesting prefix of fixed-width units
//! (`|    ` / `     ` for Gradle, `|  ` / `   ` for Maven) followed by a
//! branch marker. The depth of a line is the number of units before its
//! marker; depth 0 is a direct dependency, anything deeper is transitive.

use std::collections::HashSet;
use std::path::Path;

use crate::models::{Dependency, DependencyType, Ecosystem};

/// A dependency line of a text tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLine<'a> {
    pub depth: usize,
    /// Text after the branch marker.
    pub text: &'a str,
}

const MARKERS: &[(&str, usize)] = &[("+--- ", 5), ("\\--- ", 5), ("+- ", 3), ("\\- ", 3)];

/// Drop the `[INFO] ` prefix Maven puts on every log line.
pub fn strip_log_prefix(line: &str) -> &str {
    line.strip_prefix("[INFO] ")
        .or_else(|| line.strip_prefix("[INFO]"))
        .unwrap_or(line)
}

/// Tokenize one line; `None` for anything that is not a dependency line.
pub fn tokenize(line: &str) -> Option<TreeLine<'_>> {
    let line = strip_log_prefix(line.trim_end());
    let prefix_len = line
        .find(|c: char| c != '|' && c != ' ')
        .unwrap_or(line.len());
    let rest = &line[prefix_len..];
    let (marker, width) = MARKERS.iter().find(|(m, _)| rest.starts_with(m))?;
    let text = rest[marker.len()..].trim();
    if text.is_empty() {
        return None;
    }
    Some(TreeLine {
        depth: (prefix_len + width - 1) / width,
        text,
    })
}

/// Parse the output of `gradle <project>:dependencies --configuration <c>`.
///
/// Constraint (`(c)`) and unresolved (`(n)`) entries and project
/// dependencies are skipped; `a:b:1.0 -> 1.2` yields the resolved `1.2`.
pub fn parse_gradle_tree(output: &str, file_path: &Path, is_dev: bool) -> Vec<Dependency> {
    let mut seen = HashSet::new();
    let mut deps = Vec::new();

    for line in output.lines().filter_map(tokenize) {
        let mut text = line.text;
        if text.starts_with("project ") {
            continue;
        }
        if text.ends_with("(c)") || text.ends_with("(n)") {
            continue;
        }
        for annotation in ["(*)", "FAILED"] {
            text = text.trim_end_matches(annotation).trim_end();
        }

        let (declared, resolved) = match text.split_once(" -> ") {
            Some((left, right)) => (left.trim(), right.split_whitespace().next()),
            None => (text, None),
        };
        let parts: Vec<&str> = declared.split(':').collect();
        if parts.len() < 2 {
            continue;
        }
        let Some(version) = resolved.or_else(|| parts.get(2).copied()) else {
            continue;
        };

        let name = format!("{}:{}", parts[0], parts[1]);
        if !seen.insert(name.clone()) {
            continue;
        }
        let mut dep = Dependency::new(name, version, Ecosystem::Gradle, file_path);
        dep.dep_type = depth_type(line.depth);
        dep.is_dev = is_dev;
        deps.push(dep);
    }
    deps
}

/// Parse `mvn dependency:tree` text output.
///
/// Coordinates are `group:artifact:type[:classifier]:version[:scope]`;
/// `test` and `provided` scopes mark dev-only dependencies.
pub fn parse_maven_tree(output: &str, file_path: &Path) -> Vec<Dependency> {
    let mut seen = HashSet::new();
    let mut deps = Vec::new();

    for line in output.lines().filter_map(tokenize) {
        let Some(coordinate) = line.text.split_whitespace().next() else {
            continue;
        };
        let parts: Vec<&str> = coordinate.split(':').collect();
        let (version, scope) = match parts.len() {
            4 => (parts[3], None),
            5 => (parts[3], Some(parts[4])),
            6 => (parts[4], Some(parts[5])),
            _ => continue,
        };

        let name = format!("{}:{}", parts[0], parts[1]);
        if !seen.insert(name.clone()) {
            continue;
        }
        let mut dep = Dependency::new(name, version, Ecosystem::Maven, file_path);
        dep.dep_type = depth_type(line.depth);
        dep.is_dev = matches!(scope, Some("test") | Some("provided"));
        deps.push(dep);
    }
    deps
}

fn depth_type(depth: usize) -> DependencyType {
    if depth == 0 {
        DependencyType::Direct
    } else {
        DependencyType::Transitive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_from_prefix_units() {
        assert_eq!(tokenize("+--- a:b:1.0").map(|l| l.depth), Some(0));
        assert_eq!(tokenize("\\--- a:b:1.0").map(|l| l.depth), Some(0));
        assert_eq!(tokenize("|    +--- a:b:1.0").map(|l| l.depth), Some(1));
        assert_eq!(tokenize("|    |         \\--- a:b:1.0").map(|l| l.depth), Some(3));
        assert_eq!(tokenize("[INFO] +- a:b:jar:1.0:compile").map(|l| l.depth), Some(0));
        assert_eq!(tokenize("[INFO] |  \\- a:b:jar:1.0:compile").map(|l| l.depth), Some(1));
        assert_eq!(tokenize("[INFO]    \\- a:b:jar:1.0:compile").map(|l| l.depth), Some(1));
        assert_eq!(tokenize("[INFO] com.example:app:jar:1.0"), None);
        assert_eq!(tokenize("runtimeClasspath - Runtime classpath"), None);
    }

    #[test]
    fn test_gradle_tree() {
        let output = "\
runtimeClasspath - Runtime classpath of source set 'main'.
+--- org.springframework:spring-core:5.3.0 -> 5.3.20
|    \\--- org.springframework:spring-jcl:5.3.20
+--- com.google.guava:guava:31.1-jre
|    +--- com.google.guava:failureaccess:1.0.1
|    \\--- org.springframework:spring-jcl:5.3.20 (*)
+--- project :lib
+--- org.yaml:snakeyaml:1.33 (c)
\\--- io.netty:netty-bom -> 4.1.86.Final (n)

(c) - A dependency constraint, not a dependency.
";
        let deps = parse_gradle_tree(output, Path::new("build.gradle"), false);
        let names: Vec<&str> = deps.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "org.springframework:spring-core",
                "org.springframework:spring-jcl",
                "com.google.guava:guava",
                "com.google.guava:failureaccess",
            ]
        );
        assert_eq!(deps[0].version, "5.3.20");
        assert_eq!(deps[0].dep_type, DependencyType::Direct);
        assert_eq!(deps[1].dep_type, DependencyType::Transitive);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let output = "+--- a:b:1.0\n|    \\--- c:d:2.0\n\\--- c:d:3.0\n";
        let deps = parse_gradle_tree(output, Path::new("build.gradle"), false);
        let cd = deps.iter().find(|d| d.name == "c:d").unwrap();
        assert_eq!(cd.version, "2.0");
        assert_eq!(cd.dep_type, DependencyType::Transitive);
    }

    #[test]
    fn test_maven_tree() {
        let output = "\
[INFO] Scanning for projects...
[INFO] --- maven-dependency-plugin:3.6.0:tree (default-cli) @ app ---
[INFO] com.example:app:jar:1.0.0
[INFO] +- com.google.code.gson:gson:jar:2.8.0:compile
[INFO] +- org.springframework:spring-web:jar:5.3.0:compile
[INFO] |  \\- org.springframework:spring-beans:jar:5.3.0:compile
[INFO] +- io.netty:netty-transport-native-epoll:jar:linux-x86_64:4.1.86.Final:runtime
[INFO] \\- junit:junit:jar:4.12:test
[INFO]    \\- org.hamcrest:hamcrest-core:jar:1.3:test
[INFO] BUILD SUCCESS
";
        let deps = parse_maven_tree(output, Path::new("pom.xml"));
        assert_eq!(deps.len(), 6);
        assert_eq!(deps[0].name, "com.google.code.gson:gson");
        assert_eq!(deps[0].dep_type, DependencyType::Direct);
        assert_eq!(deps[2].dep_type, DependencyType::Transitive);
        assert_eq!(deps[3].version, "4.1.86.Final");
        assert!(deps[4].is_dev);
        assert_eq!(deps[5].name, "org.hamcrest:hamcrest-core");
        assert_eq!(deps[5].dep_type, DependencyType::Transitive);
    }
}
