//! Cache key canonicalisation (§4.A): `endpoint + "?" + join("&", sort_by_name(params))`.

/// Builds the canonical fingerprint for an endpoint call. Parameter order never affects the
/// result; missing params behave identically to an empty parameter list.
pub fn fingerprint(endpoint: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort_by_key(|(name, _)| *name);
    let joined = sorted
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{endpoint}?{joined}")
}
