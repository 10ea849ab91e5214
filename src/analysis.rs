//! Deterministic query analysis: turns raw ticket text into the
//! [`QueryData`] the retriever consumes.

use std::collections::{BTreeMap, HashMap};

use helpdesk_harness_core::embedding::tokenize;
use helpdesk_harness_core::models::QueryData;

pub const GENERAL_CATEGORY: &str = "general";
pub const MAX_KEYWORDS: usize = 10;

/// Category keyword rules, in tie-break order.
const CATEGORY_RULES: &[(&str, &[&str])] = &[
    (
        "security",
        &[
            "security", "2fa", "mfa", "factor", "authenticator", "permission", "permissions",
            "encryption", "gdpr", "rgpd", "securite", "sécurité", "role", "roles",
        ],
    ),
    (
        "authentication",
        &[
            "login", "log", "signin", "sign", "password", "passwords", "authentication", "sso",
            "locked", "connexion", "mdp", "passe",
        ],
    ),
    (
        "technical",
        &[
            "error", "bug", "crash", "broken", "slow", "fails", "failed", "timeout", "500", "404",
            "erreur", "lent",
        ],
    ),
    (
        "billing",
        &[
            "plan", "plans", "invoice", "invoices", "payment", "price", "pricing", "billing",
            "refund", "subscription", "facture", "paiement", "prix", "tarif",
        ],
    ),
    (
        "projects_tasks",
        &[
            "project", "projects", "task", "tasks", "kanban", "board", "milestone", "projet",
            "tâche", "tâches",
        ],
    ),
    (
        "integrations",
        &[
            "integration", "integrations", "api", "webhook", "webhooks", "slack", "github",
            "zapier", "import", "export", "intégration",
        ],
    ),
    (
        "collaboration",
        &[
            "team", "teammate", "teammates", "share", "sharing", "invite", "notification",
            "notifications", "comment", "mention", "équipe", "partage",
        ],
    ),
    (
        "onboarding",
        &[
            "start", "started", "setup", "onboarding", "tutorial", "getting", "démarrage",
            "configuration",
        ],
    ),
];

/// Built-in category → source allow-list table.
const CATEGORY_DOCUMENTS: &[(&str, &[&str])] = &[
    ("technical", &["troubleshooting", "faq"]),
    ("authentication", &["troubleshooting", "guide_securite"]),
    ("projects_tasks", &["guide_utilisateur", "troubleshooting"]),
    ("collaboration", &["guide_utilisateur", "faq"]),
    ("integrations", &["guide_utilisateur", "troubleshooting"]),
    ("billing", &["tarification", "conditions_generales"]),
    ("security", &["guide_securite", "conditions_generales"]),
    ("onboarding", &["guide_onboarding", "guide_utilisateur"]),
    (GENERAL_CATEGORY, &["faq", "guide_utilisateur"]),
];

const STOPWORDS: &[&str] = &[
    // English
    "the", "and", "for", "are", "but", "not", "you", "your", "all", "can", "how", "what", "when",
    "where", "why", "who", "does", "did", "has", "have", "had", "was", "were", "this", "that",
    "these", "those", "with", "from", "into", "out", "our", "its", "it", "is", "to", "of", "in",
    "on", "at", "by", "an", "or", "as", "be", "do", "my", "me", "we", "i", "so", "if", "no",
    "yes", "please", "hello", "hi", "thanks", "thank", "there", "their", "them", "then", "than",
    "any", "some", "get", "got", "about", "would", "could", "should", "will", "just", "still",
    "also", "been", "being", "am", "up", "again", "want", "need", "help",
    // French
    "le", "la", "les", "un", "une", "des", "du", "de", "et", "ou", "est", "sont", "pour", "par",
    "sur", "dans", "avec", "sans", "que", "qui", "quoi", "comment", "je", "tu", "il", "elle",
    "nous", "vous", "ils", "mon", "ma", "mes", "ton", "ta", "tes", "son", "sa", "ses", "ce",
    "cette", "ces", "pas", "ne", "plus", "bonjour", "merci", "au", "aux", "en", "se", "si",
];

/// Classifier and allow-list mapper.
#[derive(Debug, Clone)]
pub struct QueryAnalyzer {
    category_documents: BTreeMap<String, Vec<String>>,
    max_keywords: usize,
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self {
            category_documents: CATEGORY_DOCUMENTS
                .iter()
                .map(|(c, docs)| (c.to_string(), docs.iter().map(|d| d.to_string()).collect()))
                .collect(),
            max_keywords: MAX_KEYWORDS,
        }
    }
}

impl QueryAnalyzer {
    /// Built-in allow-list table with `overrides` merged on top.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> Self {
        let mut analyzer = Self::default();
        for (category, docs) in overrides {
            analyzer
                .category_documents
                .insert(category.trim().to_lowercase(), docs.clone());
        }
        analyzer
    }

    pub fn documents_for(&self, category: &str) -> Vec<String> {
        self.category_documents
            .get(category)
            .or_else(|| self.category_documents.get(GENERAL_CATEGORY))
            .cloned()
            .unwrap_or_default()
    }

    pub fn analyze(&self, text: &str) -> QueryData {
        let category = classify(text);
        QueryData {
            reformulation: reformulate(text),
            keywords: extract_keywords(text, self.max_keywords),
            category: category.to_string(),
            documents: self.documents_for(category),
        }
    }
}

/// Whitespace-normalized question text.
pub fn reformulate(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Most frequent non-stopword tokens, ties broken by first occurrence.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, token) in tokenize(text).enumerate() {
        if is_stopword(&token) {
            continue;
        }
        counts.entry(token).or_insert((0, position)).0 += 1;
    }
    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(token, (count, first))| (token, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(max).map(|(t, _, _)| t).collect()
}

/// Category with the most keyword hits; [`GENERAL_CATEGORY`] when none hit.
pub fn classify(text: &str) -> &'static str {
    let tokens: Vec<String> = tokenize(text).collect();
    let mut best = (GENERAL_CATEGORY, 0usize);
    for (category, words) in CATEGORY_RULES {
        let hits = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
        if hits > best.1 {
            best = (*category, hits);
        }
    }
    best.0
}
