//! Board state: stage/card ownership and atomic card movement
//!
//! The board is the exclusive section guarding stage and card positions.
//! A move enforces movement rules and the destination WIP limit, then
//! renumbers both stages so positions stay unique and contiguous from 0,
//! and only then reports the committed mutation for trigger evaluation.
//! Callers hold `&mut Board` for the whole move, so the evaluator always
//! sees a consistent post-move snapshot.

use studioflow_types::{
    ensure_valid, validate_card, BoardId, CardId, CardMutation, ExecutionId, FieldValue,
    KanbanCard, KanbanStage, StageId, WorkflowError, WorkflowResult,
};

/// A kanban board owning its stages and cards
#[derive(Clone, Debug)]
pub struct Board {
    id: BoardId,
    stages: Vec<KanbanStage>,
    cards: Vec<KanbanCard>,
}

impl Board {
    pub fn new(id: BoardId) -> Self {
        Self {
            id,
            stages: Vec::new(),
            cards: Vec::new(),
        }
    }

    pub fn id(&self) -> &BoardId {
        &self.id
    }

    // ── Stages ───────────────────────────────────────────────────────

    /// Append a stage; its position is assigned to keep board positions
    /// contiguous from 0.
    pub fn add_stage(&mut self, mut stage: KanbanStage) -> StageId {
        stage.position = self.stages.len() as u32;
        stage.board_id = self.id.clone();
        let id = stage.id.clone();
        self.stages.push(stage);
        id
    }

    pub fn stage(&self, id: &StageId) -> WorkflowResult<&KanbanStage> {
        self.stages
            .iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| WorkflowError::StageNotFound(id.clone()))
    }

    pub fn stages(&self) -> &[KanbanStage] {
        &self.stages
    }

    // ── Cards ────────────────────────────────────────────────────────

    pub fn card(&self, id: &CardId) -> WorkflowResult<&KanbanCard> {
        self.cards
            .iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| WorkflowError::CardNotFound(id.clone()))
    }

    fn card_mut(&mut self, id: &CardId) -> WorkflowResult<&mut KanbanCard> {
        self.cards
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| WorkflowError::CardNotFound(id.clone()))
    }

    /// Cards located in a stage, ordered by position
    pub fn cards_in_stage(&self, stage_id: &StageId) -> Vec<&KanbanCard> {
        let mut cards: Vec<&KanbanCard> = self
            .cards
            .iter()
            .filter(|c| &c.stage_id == stage_id)
            .collect();
        cards.sort_by_key(|c| c.position);
        cards
    }

    fn active_count(&self, stage_id: &StageId) -> u32 {
        self.cards
            .iter()
            .filter(|c| &c.stage_id == stage_id && c.counts_against_wip())
            .count() as u32
    }

    /// Create a card in its stage, producing the committed stage-entry
    /// mutation for trigger evaluation.
    pub fn add_card(&mut self, mut card: KanbanCard) -> WorkflowResult<CardMutation> {
        ensure_valid(validate_card(&card))?;
        let stage = self.stage(&card.stage_id)?;
        self.check_entry_rules(stage, &card)?;

        card.board_id = self.id.clone();
        card.position = self.cards_in_stage(&card.stage_id).len() as u32;
        tracing::debug!(card_id = %card.id, stage_id = %card.stage_id, "Card created");
        self.cards.push(card);

        Ok(CardMutation::StageEntry { from_stage: None })
    }

    /// Move a card, atomically renumbering source and destination stages.
    ///
    /// Returns the committed stage-entry mutation, or `None` for a
    /// same-stage reorder (repositioning is not a stage entry).
    pub fn move_card(
        &mut self,
        card_id: &CardId,
        target_stage_id: &StageId,
        position: u32,
    ) -> WorkflowResult<Option<CardMutation>> {
        let card = self.card(card_id)?.clone();
        let source = self.stage(&card.stage_id)?.clone();
        let target = self.stage(target_stage_id)?.clone();

        if source.id == target.id {
            self.reposition_within_stage(card_id, position)?;
            return Ok(None);
        }

        if source.rules.prevent_move_back && target.position < source.position {
            return Err(WorkflowError::MoveRejected(format!(
                "stage '{}' does not allow moving cards back to '{}'",
                source.name, target.name
            )));
        }
        self.check_entry_rules(&target, &card)?;

        // Close the gap in the source stage.
        let old_position = card.position;
        for other in &mut self.cards {
            if other.stage_id == source.id && other.position > old_position {
                other.position -= 1;
            }
        }

        // Open a slot in the destination stage.
        let destination_len = self.cards_in_stage(target_stage_id).len() as u32;
        let new_position = position.min(destination_len);
        for other in &mut self.cards {
            if &other.stage_id == target_stage_id && other.position >= new_position {
                other.position += 1;
            }
        }

        let now = chrono::Utc::now();
        let card = self.card_mut(card_id)?;
        card.stage_id = target_stage_id.clone();
        card.position = new_position;
        card.updated_at = now;

        tracing::info!(
            card_id = %card_id,
            from = %source.id,
            to = %target_stage_id,
            position = new_position,
            "Card moved"
        );

        Ok(Some(CardMutation::StageEntry {
            from_stage: Some(source.id),
        }))
    }

    /// Update one custom field, producing the committed attribute-change
    /// mutation for trigger evaluation.
    pub fn update_card_field(
        &mut self,
        card_id: &CardId,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> WorkflowResult<CardMutation> {
        let field = field.into();
        let value = value.into();

        let card = self.card_mut(card_id)?;
        let old_value = card.custom_fields.insert(field.clone(), value.clone());
        card.updated_at = chrono::Utc::now();

        Ok(CardMutation::AttributeChange {
            field,
            old_value,
            new_value: value,
        })
    }

    /// Record the back-reference to an execution this card fired
    pub fn link_execution(
        &mut self,
        card_id: &CardId,
        execution_id: ExecutionId,
    ) -> WorkflowResult<()> {
        let card = self.card_mut(card_id)?;
        card.workflow_execution_id = Some(execution_id);
        card.updated_at = chrono::Utc::now();
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Rules checked before a card enters a stage
    fn check_entry_rules(&self, stage: &KanbanStage, card: &KanbanCard) -> WorkflowResult<()> {
        if let Some(limit) = stage.wip_limit {
            if self.active_count(&stage.id) >= limit {
                return Err(WorkflowError::WipLimitReached {
                    stage_id: stage.id.clone(),
                    limit,
                });
            }
        }
        if stage.rules.require_assignee && card.assigned_to.is_none() {
            return Err(WorkflowError::MoveRejected(format!(
                "stage '{}' requires an assignee",
                stage.name
            )));
        }
        Ok(())
    }

    fn reposition_within_stage(&mut self, card_id: &CardId, position: u32) -> WorkflowResult<()> {
        let card = self.card(card_id)?;
        let stage_id = card.stage_id.clone();
        let old_position = card.position;
        let stage_len = self.cards_in_stage(&stage_id).len() as u32;
        let new_position = position.min(stage_len.saturating_sub(1));
        if new_position == old_position {
            return Ok(());
        }

        for other in &mut self.cards {
            if other.stage_id != stage_id || &other.id == card_id {
                continue;
            }
            if old_position < new_position
                && other.position > old_position
                && other.position <= new_position
            {
                other.position -= 1;
            } else if old_position > new_position
                && other.position >= new_position
                && other.position < old_position
            {
                other.position += 1;
            }
        }

        let card = self.card_mut(card_id)?;
        card.position = new_position;
        card.updated_at = chrono::Utc::now();
        Ok(())
    }
}
