//! Province groups accepted by the master view's `province` filter.

// ---

/// Group name -> registry province values it stands for.
pub const PROVINCE_GROUPS: &[(&str, &[&str])] = &[
    ("Maluku", &["MALUKU", "MALUKU UTARA"]),
    ("Papua", &["PAPUA BARAT", "PAPUA BARAT DAYA", "PAPUA SELATAN"]),
];

/// Registry province values matched by `filter`. A group name expands to its
/// members; anything else matches itself.
pub fn expand(filter: &str) -> Vec<String> {
    let filter = filter.trim();
    PROVINCE_GROUPS
        .iter()
        .find(|(group, _)| group.eq_ignore_ascii_case(filter))
        .map(|(_, members)| members.iter().map(|m| m.to_string()).collect())
        .unwrap_or_else(|| vec![filter.to_ascii_uppercase()])
}

/// Whether a site's registry province satisfies `filter`.
pub fn matches(filter: &str, province: Option<&str>) -> bool {
    let Some(province) = province.map(str::trim) else {
        return false;
    };
    expand(filter)
        .iter()
        .any(|member| member.eq_ignore_ascii_case(province))
}
