//! Static host name translation.
//!
//! Add replacement entries to `RAW_TABLE` below; [`TranslationTable::load`] sorts
//! them once at startup so lookups are a plain binary search on exact equality.

#[derive(Debug, Clone, Copy)]
struct Entry {
    name: &'static str,
    replacement: &'static str,
}

// TODO: add your translation addresses here
const RAW_TABLE: &[Entry] = &[
    Entry {
        name: "pop.riseup.net",
        replacement: "5gdvpfoh6kb2iqbizb37lzk2ddzrwa47m6rpdueg2m656fovmbhoptqd.onion",
    },
    Entry {
        name: "smtp.riseup.net",
        replacement: "5gdvpfoh6kb2iqbizb37lzk2ddzrwa47m6rpdueg2m656fovmbhoptqd.onion",
    },
];

/// Sorted, read-only mapping from plain host name to replacement host name.
pub struct TranslationTable {
    entries: Vec<Entry>,
}

impl TranslationTable {
    pub fn load() -> Self {
        let mut entries = RAW_TABLE.to_vec();
        entries.sort_by(|a, b| a.name.cmp(b.name));
        TranslationTable { entries }
    }

    /// Exact-match binary search. Returns `name` unchanged on a miss.
    pub fn translate<'a>(&'a self, name: &'a str) -> &'a str {
        match self
            .entries
            .binary_search_by(|entry| entry.name.cmp(name))
        {
            Ok(i) => self.entries[i].replacement,
            Err(_) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_known_host() {
        let table = TranslationTable::load();
        assert_eq!(
            table.translate("pop.riseup.net"),
            "5gdvpfoh6kb2iqbizb37lzk2ddzrwa47m6rpdueg2m656fovmbhoptqd.onion"
        );
    }

    #[test]
    fn passes_through_unknown_host() {
        let table = TranslationTable::load();
        assert_eq!(table.translate("example.com"), "example.com");
    }

    #[test]
    fn translation_is_idempotent() {
        let table = TranslationTable::load();
        let once = table.translate("pop.riseup.net");
        let twice = table.translate(once);
        assert_eq!(once, twice);
    }

    #[test]
    fn table_is_sorted_after_load() {
        let table = TranslationTable::load();
        for pair in table.entries.windows(2) {
            assert!(pair[0].name <= pair[1].name);
        }
    }
}
