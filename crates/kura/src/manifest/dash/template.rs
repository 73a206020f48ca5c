use regex::{Regex, Replacer};
use std::{collections::HashMap, sync::LazyLock};

// Only `%0[width]d` is permitted as a format tag (DASH-IF IOP 4.3), so the
// substitution is done here instead of through a printf implementation.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap()
});

#[derive(Debug, Clone, Default)]
pub struct Template {
    args: HashMap<&'static str, String>,
}

impl Template {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";

    pub fn new() -> Self {
        Self {
            args: HashMap::with_capacity(4),
        }
    }

    pub fn insert(&mut self, key: &'static str, value: String) -> &mut Self {
        self.args.insert(key, value);
        self
    }

    pub fn resolve(&self, template: &str) -> String {
        TEMPLATE_REGEX
            .replace_all(template, TemplateReplacer(&self.args))
            .replace("$$", "$")
    }
}

struct TemplateReplacer<'a>(&'a HashMap<&'static str, String>);

impl Replacer for TemplateReplacer<'_> {
    fn replace_append(&mut self, caps: &regex::Captures<'_>, dst: &mut String) {
        let key = &caps[1];
        let Some(value) = self.0.get(key) else {
            dst.push_str(&caps[0]);
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_replace() {
        let mut template = Template::new();
        template
            .insert(Template::REPRESENTATION_ID, "1".to_string())
            .insert(Template::NUMBER, "2".to_string())
            .insert(Template::TIME, "3".to_string())
            .insert(Template::BANDWIDTH, "4".to_string());

        assert_eq!(template.resolve("$RepresentationID$"), "1");
        assert_eq!(template.resolve("$Number%02d$"), "02");
        assert_eq!(
            template.resolve("$RepresentationID%02d$-$Number%09d$"),
            "01-000000002"
        );
        assert_eq!(template.resolve("$Number%010d$"), "0000000002");
        assert_eq!(
            template.resolve("$RepresentationID$-$Number$-$Time$-$Bandwidth$"),
            "1-2-3-4"
        );
        assert_eq!(template.resolve("price$$"), "price$");

        // Unknown variable
        assert_eq!(template.resolve("$Unknown$"), "$Unknown$");
    }

    #[test]
    fn test_template_variable_not_defined() {
        let template = Template::new();
        assert_eq!(template.resolve("$RepresentationID$"), "$RepresentationID$");
    }
}
