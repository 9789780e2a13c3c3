//! Template variable resolution

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use wapush_core::{CampaignRecipient, MessageTemplate, RECIPIENT_NAME_SENTINEL};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Merge campaign and recipient variables, recipient values winning.
/// The name sentinel becomes the recipient's name, or "" without one.
pub fn resolve_variables(
    campaign_variables: &BTreeMap<String, String>,
    recipient: &CampaignRecipient,
) -> BTreeMap<String, String> {
    let mut merged = campaign_variables.clone();
    if let Some(overrides) = &recipient.variables {
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    for value in merged.values_mut() {
        if value == RECIPIENT_NAME_SENTINEL {
            *value = recipient.name.clone().unwrap_or_default();
        }
    }
    merged
}

/// Placeholder names in the order they first appear in the body
pub fn placeholder_order(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for capture in PLACEHOLDER.captures_iter(body) {
        let name = &capture[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Fallback order without a template body: numeric if every name is a
/// number, otherwise lexical
fn default_order(variables: &BTreeMap<String, String>) -> Vec<String> {
    let mut numeric: Vec<(u32, &String)> = Vec::with_capacity(variables.len());
    for name in variables.keys() {
        match name.parse::<u32>() {
            Ok(n) => numeric.push((n, name)),
            Err(_) => return variables.keys().cloned().collect(),
        }
    }
    numeric.sort_by_key(|(n, _)| *n);
    numeric.into_iter().map(|(_, name)| name.clone()).collect()
}

/// Ordered body parameters for a send.
///
/// Empty when every resolved value is empty, so templates without
/// variables never receive blank placeholders.
pub fn build_parameters(
    resolved: &BTreeMap<String, String>,
    template: Option<&MessageTemplate>,
) -> Vec<String> {
    let order = match template {
        Some(t) => {
            let order = placeholder_order(&t.body);
            if order.is_empty() { default_order(resolved) } else { order }
        }
        None => default_order(resolved),
    };

    let parameters: Vec<String> = order
        .iter()
        .map(|name| resolved.get(name).cloned().unwrap_or_default())
        .collect();

    if parameters.iter().all(|p| p.is_empty()) {
        Vec::new()
    } else {
        parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn template(body: &str) -> MessageTemplate {
        MessageTemplate {
            account_id: "acct-1".to_string(),
            name: "promo".to_string(),
            language: "pt_BR".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_name_sentinel() {
        let campaign = vars(&[("1", RECIPIENT_NAME_SENTINEL)]);

        let maria = CampaignRecipient::new("c1", "5511900000001", Some("Maria".to_string()));
        let resolved = resolve_variables(&campaign, &maria);
        assert_eq!(resolved["1"], "Maria");
        assert_eq!(build_parameters(&resolved, None), vec!["Maria"]);

        let anonymous = CampaignRecipient::new("c1", "5511900000002", None);
        let resolved = resolve_variables(&campaign, &anonymous);
        assert_eq!(resolved["1"], "");
        assert!(build_parameters(&resolved, None).is_empty());
    }

    #[test]
    fn test_recipient_overrides_win() {
        let campaign = vars(&[("1", "Cliente"), ("2", "10%")]);
        let recipient = CampaignRecipient::new("c1", "5511900000001", None)
            .with_variables(vars(&[("2", "20%")]));
        let resolved = resolve_variables(&campaign, &recipient);
        assert_eq!(build_parameters(&resolved, None), vec!["Cliente", "20%"]);
    }

    #[test]
    fn test_body_declaration_order() {
        let body = "Olá {{nome}}, use o cupom {{ cupom }} até {{validade}}. {{nome}}!";
        assert_eq!(placeholder_order(body), vec!["nome", "cupom", "validade"]);

        let resolved = vars(&[("cupom", "BEMVINDO"), ("nome", "Ana"), ("validade", "sexta")]);
        assert_eq!(
            build_parameters(&resolved, Some(&template(body))),
            vec!["Ana", "BEMVINDO", "sexta"]
        );
    }

    #[test]
    fn test_numeric_fallback_order() {
        let resolved = vars(&[("10", "j"), ("2", "b"), ("1", "a")]);
        assert_eq!(build_parameters(&resolved, None), vec!["a", "b", "j"]);

        // Template without placeholders falls back as well
        assert_eq!(
            build_parameters(&resolved, Some(&template("Sem variáveis"))),
            vec!["a", "b", "j"]
        );
    }

    #[test]
    fn test_empty_values_send_no_parameters() {
        assert!(build_parameters(&BTreeMap::new(), None).is_empty());
        let resolved = vars(&[("1", ""), ("2", "")]);
        assert!(build_parameters(&resolved, Some(&template("{{1}} {{2}}"))).is_empty());
    }
}
