//! JavaScript evaluated on the map provider's results page.

/// The scrollable results pane
pub const RESULTS_SELECTOR: &str = "div[role=\"feed\"]";

/// Collect the currently rendered listing cards.
///
/// Returns an array of `{name, phone, address, url}`; fields other than
/// `name` may be null when the card does not render them.
pub const HARVEST_SCRIPT: &str = r#"
    (() => {
        const feed = document.querySelector('div[role="feed"]');
        if (!feed) return [];
        const cards = Array.from(feed.querySelectorAll('div[role="article"], a[href*="/maps/place/"]'));
        const seen = new Set();
        const listings = [];
        for (const card of cards) {
            const root = card.closest('div[role="article"]') || card;
            const name = (root.getAttribute('aria-label')
                || root.querySelector('[class*="fontHeadline"]')?.textContent
                || '').trim();
            if (!name || seen.has(name)) continue;
            seen.add(name);
            const text = root.innerText || '';
            const phoneMatch = text.match(/(\+27[\s\d]{9,13}|0\d{2}[\s-]?\d{3}[\s-]?\d{4})/);
            const addressNode = root.querySelector('[class*="fontBodyMedium"]');
            const link = root.querySelector('a[href*="/maps/place/"]');
            listings.push({
                name: name,
                phone: phoneMatch ? phoneMatch[1] : null,
                address: addressNode ? addressNode.textContent.trim() : null,
                url: link ? link.href : null
            });
        }
        return listings;
    })()
"#;

/// Scroll the results pane one viewport further; returns the card count
pub const SCROLL_SCRIPT: &str = r#"
    (() => {
        const feed = document.querySelector('div[role="feed"]');
        if (!feed) return 0;
        feed.scrollBy(0, feed.clientHeight);
        return feed.querySelectorAll('div[role="article"]').length;
    })()
"#;
