//! Page layout: places panels on a grid in reading order.

use crate::core::state::{MasterScript, PanelLayout};
use log::info;

/// Assign every panel a grid slot.
///
/// Panels fill pages of `per_page` slots left to right, top to bottom. The
/// last page only gets as many rows as it needs. Returns the page count.
pub fn assign_layout(script: &mut MasterScript, columns: u32, per_page: u32) -> u32 {
    let columns = columns.max(1);
    let per_page = per_page.max(columns);
    let total = script.panel_count() as u32;
    if total == 0 {
        return 0;
    }
    let pages = total.div_ceil(per_page);

    for (i, panel) in script.panels_mut().enumerate() {
        let i = i as u32;
        let page = i / per_page;
        let slot = i % per_page;
        let on_page = (total - page * per_page).min(per_page);
        panel.layout = Some(PanelLayout {
            page: page + 1,
            row: slot / columns,
            column: slot % columns,
            rows: on_page.div_ceil(columns),
            columns,
        });
    }

    info!("Laid out {} panel(s) on {} page(s)", total, pages);
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{Panel, Scene};

    fn script(panels_per_scene: &[u32]) -> MasterScript {
        let mut next = 0;
        let scenes = panels_per_scene
            .iter()
            .enumerate()
            .map(|(i, n)| Scene {
                id: i as u32 + 1,
                location: format!("scene {}", i + 1),
                panels: (0..*n)
                    .map(|_| {
                        next += 1;
                        Panel {
                            id: next,
                            description: format!("panel {}", next),
                            ..Default::default()
                        }
                    })
                    .collect(),
                ..Default::default()
            })
            .collect();
        MasterScript {
            scenes,
            ..Default::default()
        }
    }

    #[test]
    fn test_two_column_grid_across_scenes() {
        let mut s = script(&[2, 1]);
        assert_eq!(assign_layout(&mut s, 2, 6), 1);

        let slots: Vec<_> = s.panels().map(|p| p.layout.unwrap()).collect();
        assert_eq!((slots[0].row, slots[0].column), (0, 0));
        assert_eq!((slots[1].row, slots[1].column), (0, 1));
        assert_eq!((slots[2].row, slots[2].column), (1, 0));
        assert!(slots.iter().all(|l| l.rows == 2 && l.columns == 2 && l.page == 1));

        let last = slots[2];
        assert_eq!(last.x(), 0.0);
        assert_eq!(last.y(), 0.5);
        assert_eq!(last.width(), 0.5);
        assert_eq!(last.height(), 0.5);
    }

    #[test]
    fn test_overflow_starts_a_new_page_with_fewer_rows() {
        let mut s = script(&[5, 2]);
        assert_eq!(assign_layout(&mut s, 2, 4), 2);

        let p5 = s.panel(5).unwrap().layout.unwrap();
        assert_eq!(p5.page, 2);
        assert_eq!((p5.row, p5.column), (0, 0));
        assert_eq!(p5.rows, 2);

        let p4 = s.panel(4).unwrap().layout.unwrap();
        assert_eq!(p4.page, 1);
        assert_eq!((p4.row, p4.column, p4.rows), (1, 1, 2));
    }

    #[test]
    fn test_degenerate_settings_are_clamped() {
        let mut s = script(&[3]);
        assert_eq!(assign_layout(&mut s, 0, 0), 3);
        let p2 = s.panel(2).unwrap().layout.unwrap();
        assert_eq!((p2.page, p2.row, p2.column, p2.rows, p2.columns), (2, 0, 0, 1, 1));
        assert_eq!(p2.height(), 1.0);

        let mut empty = MasterScript::default();
        assert_eq!(assign_layout(&mut empty, 2, 6), 0);
    }
}
