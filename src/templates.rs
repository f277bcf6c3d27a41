//! Template collaborator
//!
//! Turns a variant name plus the parent's existing child into the content of
//! the themed child, and checks every rendered field against the remote's
//! static limits using the worst-case length of embedded functions.

use regex::Regex;
use thiserror::Error;

use crate::config::TemplateLimitsConfig;
use crate::remote::{ChildContent, RemoteChild};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown variant '{0}'")]
    UnknownVariant(String),
    #[error("existing child has no final URL")]
    MissingFinalUrl,
    #[error("{field} '{text}' can render to {length} characters (limit {limit})")]
    TooLong {
        field: &'static str,
        text: String,
        length: usize,
        limit: usize,
    },
    #[error("{field} count {count} exceeds limit {limit}")]
    TooMany {
        field: &'static str,
        count: usize,
        limit: usize,
    },
    #[error("invalid placeholder pattern: {0}")]
    Pattern(String),
}

/// Content for one new child plus the tag naming its variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub variant: String,
    pub tag: String,
    pub content: ChildContent,
}

pub trait TemplateProvider: Send + Sync {
    /// Canonical variant name for `raw`, accepting aliases.
    fn normalize_variant(&self, raw: &str) -> Option<String>;

    /// Variant tag, e.g. `THEME_BF`.
    fn variant_tag(&self, variant: &str) -> Result<String, TemplateError>;

    /// Renders and validates the child that replaces `base`.
    fn render(&self, variant: &str, base: &RemoteChild) -> Result<RenderedTemplate, TemplateError>;
}

struct Theme {
    variant: &'static str,
    tag: &'static str,
    slug: &'static str,
    aliases: &'static [&'static str],
    headlines: &'static [&'static str],
    descriptions: &'static [&'static str],
}

const THEMES: &[Theme] = &[
    Theme {
        variant: "black_friday",
        tag: "THEME_BF",
        slug: "black-friday",
        aliases: &["bf", "blackfriday", "black-friday"],
        headlines: &[
            "Black Friday Deals",
            "Black Friday Korting",
            "Nu In De Black Friday Sale",
            "Black Friday: Tot 50% Korting",
            "{KeyWord:Black Friday} Aanbieding",
            "Black Friday Over {=COUNTDOWN(\"2026-11-27 00:00:00\",\"nl\")}",
            "Shop Black Friday Deals",
            "Black Friday Topdeals",
            "Exclusieve Black Friday Deals",
            "Black Friday Week",
            "Profiteer Van Black Friday",
            "Black Friday Bij Ons",
        ],
        descriptions: &[
            "Profiteer nu van onze Black Friday aanbiedingen. Op = op, dus wees er snel bij!",
            "De beste Black Friday deals van het jaar. Bestel vandaag en bespaar direct.",
            "Black Friday bij ons: scherpe prijzen op het hele assortiment. Shop nu online.",
        ],
    },
    Theme {
        variant: "cyber_monday",
        tag: "THEME_CM",
        slug: "cyber-monday",
        aliases: &["cm", "cybermonday", "cyber-monday"],
        headlines: &[
            "Cyber Monday Deals",
            "Cyber Monday Korting",
            "{KeyWord:Cyber Monday} Sale",
            "Cyber Monday Over {=COUNTDOWN(\"2026-11-30 00:00:00\",\"nl\")}",
            "Shop Nu Met Cyber Monday",
            "Cyber Monday Topdeals",
        ],
        descriptions: &[
            "Cyber Monday is begonnen. Ontdek onze scherpste online deals van het jaar.",
            "Alleen vandaag: extra korting met Cyber Monday. Bestel snel, op = op.",
        ],
    },
    Theme {
        variant: "sinterklaas",
        tag: "THEME_SK",
        slug: "sinterklaas",
        aliases: &["sint", "sinterklaas"],
        headlines: &[
            "Sinterklaas Cadeaus",
            "Sinterklaas Aanbiedingen",
            "{KeyWord:Sinterklaas} Deals",
            "Pakjesavond Over {=COUNTDOWN(\"2026-12-05 00:00:00\",\"nl\")}",
            "Shop Sinterklaas Cadeaus",
            "Sinterklaas Korting",
        ],
        descriptions: &[
            "Vind het perfecte cadeau voor pakjesavond. Snel geleverd, voor ieder budget.",
            "Sinterklaas aanbiedingen voor groot en klein. Bestel op tijd voor 5 december.",
        ],
    },
    Theme {
        variant: "kerstmis",
        tag: "THEME_KM",
        slug: "kerstmis",
        aliases: &["kerst", "christmas", "xmas"],
        headlines: &[
            "Kerst Aanbiedingen",
            "Kerstcadeaus Voor Iedereen",
            "{KeyWord:Kerst} Deals",
            "Kerst Over {=COUNTDOWN(\"2026-12-25 00:00:00\",\"nl\")}",
            "Shop Nu Voor De Kerst",
            "Kerstkorting",
        ],
        descriptions: &[
            "Maak de feestdagen compleet met onze kerstaanbiedingen. Bestel nu online.",
            "Kerstcadeaus voor het hele gezin, op tijd geleverd onder de kerstboom.",
        ],
    },
    Theme {
        variant: "singles_day",
        tag: "THEME_SD",
        slug: "singles-day",
        aliases: &["sd", "singles", "singlesday", "singles-day"],
        headlines: &[
            "Singles Day Deals",
            "Singles Day Korting",
            "{KeyWord:Singles Day} Sale",
            "Singles Day Over {=COUNTDOWN(\"2026-11-11 00:00:00\",\"nl\")}",
            "Shop Singles Day Deals",
            "Singles Day Topdeals",
        ],
        descriptions: &[
            "Singles Day: trakteer jezelf op onze beste deals. Alleen op 11 november.",
            "Vier Singles Day met extra korting op favorieten. Shop nu, op = op.",
        ],
    },
];

/// Built-in seasonal variants.
pub struct ThemeCatalog {
    limits: TemplateLimitsConfig,
    placeholder: Regex,
}

impl ThemeCatalog {
    pub fn new(limits: TemplateLimitsConfig) -> Result<Self, TemplateError> {
        Ok(Self {
            limits,
            placeholder: Regex::new(r"\{[^{}]*\}")
                .map_err(|err| TemplateError::Pattern(err.to_string()))?,
        })
    }

    /// Canonical names of every supported variant.
    pub fn variants() -> impl Iterator<Item = &'static str> {
        THEMES.iter().map(|theme| theme.variant)
    }

    fn theme(&self, variant: &str) -> Result<&'static Theme, TemplateError> {
        THEMES
            .iter()
            .find(|theme| theme.variant == variant)
            .ok_or_else(|| TemplateError::UnknownVariant(variant.to_string()))
    }

    /// Longest text `text` can render to once placeholders are expanded.
    ///
    /// `{KeyWord:Default}` counts its default; `{=COUNTDOWN(..)}` and
    /// `{COUNTDOWN(..)}` count the configured worst case.
    pub fn worst_case_len(&self, text: &str) -> usize {
        let mut length = 0;
        let mut last = 0;
        for found in self.placeholder.find_iter(text) {
            length += text[last..found.start()].chars().count();
            let inner = &text[found.start() + 1..found.end() - 1];
            length += self.placeholder_len(inner);
            last = found.end();
        }
        length + text[last..].chars().count()
    }

    fn placeholder_len(&self, inner: &str) -> usize {
        let body = inner.trim_start_matches('=');
        let upper = body.to_ascii_uppercase();
        if upper.starts_with("COUNTDOWN") || upper.starts_with("GLOBAL_COUNTDOWN") {
            return self.limits.countdown_worst_case_chars;
        }
        match body.split_once(':') {
            Some((_, default)) => default.chars().count(),
            None => inner.chars().count() + 2,
        }
    }

    fn check_len(&self, field: &'static str, text: &str, limit: usize) -> Result<(), TemplateError> {
        let length = self.worst_case_len(text);
        if length > limit {
            return Err(TemplateError::TooLong {
                field,
                text: text.to_string(),
                length,
                limit,
            });
        }
        Ok(())
    }

    pub fn validate(&self, content: &ChildContent) -> Result<(), TemplateError> {
        let limits = &self.limits;
        if content.headlines.len() > limits.max_headlines {
            return Err(TemplateError::TooMany {
                field: "headlines",
                count: content.headlines.len(),
                limit: limits.max_headlines,
            });
        }
        if content.descriptions.len() > limits.max_descriptions {
            return Err(TemplateError::TooMany {
                field: "descriptions",
                count: content.descriptions.len(),
                limit: limits.max_descriptions,
            });
        }
        for headline in &content.headlines {
            self.check_len("headline", headline, limits.headline_max_chars)?;
        }
        for description in &content.descriptions {
            self.check_len("description", description, limits.description_max_chars)?;
        }
        self.check_len("path1", &content.path1, limits.path_max_chars)?;
        self.check_len("path2", &content.path2, limits.path_max_chars)
    }

    /// Checks every built-in line against the limits.
    pub fn validate_catalog(&self) -> Result<(), TemplateError> {
        for theme in THEMES {
            for headline in theme.headlines {
                self.check_len("headline", headline, self.limits.headline_max_chars)?;
            }
            for description in theme.descriptions {
                self.check_len("description", description, self.limits.description_max_chars)?;
            }
            self.check_len("path1", theme.slug, self.limits.path_max_chars)?;
        }
        Ok(())
    }
}

impl TemplateProvider for ThemeCatalog {
    fn normalize_variant(&self, raw: &str) -> Option<String> {
        let key = raw.trim().to_lowercase().replace(' ', "_");
        THEMES
            .iter()
            .find(|theme| theme.variant == key || theme.aliases.contains(&key.as_str()))
            .map(|theme| theme.variant.to_string())
    }

    fn variant_tag(&self, variant: &str) -> Result<String, TemplateError> {
        Ok(self.theme(variant)?.tag.to_string())
    }

    fn render(&self, variant: &str, base: &RemoteChild) -> Result<RenderedTemplate, TemplateError> {
        let theme = self.theme(variant)?;
        let final_url = base
            .final_urls
            .first()
            .filter(|url| !url.trim().is_empty())
            .ok_or(TemplateError::MissingFinalUrl)?;

        let headlines: Vec<String> = base
            .headlines
            .iter()
            .take(3)
            .cloned()
            .chain(theme.headlines.iter().map(|line| line.to_string()))
            .take(self.limits.max_headlines)
            .collect();

        let descriptions: Vec<String> = base
            .descriptions
            .iter()
            .take(1)
            .cloned()
            .chain(theme.descriptions.iter().map(|line| line.to_string()))
            .take(self.limits.max_descriptions)
            .collect();

        let path1 = theme.slug.to_string();
        let path2 = base
            .path2
            .clone()
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| path1.clone());

        let content = ChildContent {
            headlines,
            descriptions,
            final_url: final_url.clone(),
            path1,
            path2,
        };
        self.validate(&content)?;

        Ok(RenderedTemplate {
            variant: theme.variant.to_string(),
            tag: theme.tag.to_string(),
            content,
        })
    }
}
